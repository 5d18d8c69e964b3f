//! Line-oriented front end: commands from stdin, state changes printed to stdout.

use natter_core::{ChatSnapshot, ConnectionState, DeliveryState, Direction, PeerAddress};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::service::ServiceHandle;

const HELP: &str = "\
commands:
  scan                 start a discovery cycle
  stop                 stop scanning
  peers                list discovered peers
  connect <addr>       open a link
  disconnect <addr>    close a link
  send <addr> <text>   send a message
  show <addr>          print a conversation and mark it read
  delete <addr> <n>    delete message n (as numbered by `show`)
  forget <addr>        delete a whole conversation
  chats                list conversations
  quit                 shut down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Scan,
    Stop,
    Peers,
    Connect(PeerAddress),
    Disconnect(PeerAddress),
    Send(PeerAddress, String),
    Show(PeerAddress),
    Delete(PeerAddress, usize),
    Forget(PeerAddress),
    Chats,
    Help,
    Quit,
}

pub fn parse(line: &str) -> Result<Input, String> {
    let line = line.trim();
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let addr = |s: &str| -> Result<PeerAddress, String> {
        let a = PeerAddress::new(s);
        if a.is_empty() {
            Err(format!("usage: {} <addr>", cmd))
        } else {
            Ok(a)
        }
    };
    match cmd.to_ascii_lowercase().as_str() {
        "scan" => Ok(Input::Scan),
        "stop" => Ok(Input::Stop),
        "peers" => Ok(Input::Peers),
        "chats" => Ok(Input::Chats),
        "help" | "?" => Ok(Input::Help),
        "quit" | "exit" => Ok(Input::Quit),
        "connect" => addr(rest).map(Input::Connect),
        "disconnect" => addr(rest).map(Input::Disconnect),
        "show" => addr(rest).map(Input::Show),
        "forget" => addr(rest).map(Input::Forget),
        "send" => match rest.split_once(' ') {
            Some((peer, text)) if !text.trim().is_empty() => {
                Ok(Input::Send(PeerAddress::new(peer), text.trim().to_string()))
            }
            _ => Err("usage: send <addr> <text>".into()),
        },
        "delete" => {
            let mut parts = rest.split_whitespace();
            match (parts.next(), parts.next().and_then(|n| n.parse::<usize>().ok())) {
                (Some(peer), Some(n)) if n > 0 => Ok(Input::Delete(PeerAddress::new(peer), n)),
                _ => Err("usage: delete <addr> <n>".into()),
            }
        }
        "" => Err(String::new()),
        other => Err(format!("unknown command '{}' (try help)", other)),
    }
}

/// Run until `quit`. When stdin closes the service keeps running headless.
pub async fn run(handle: ServiceHandle) -> anyhow::Result<()> {
    let printer = tokio::spawn(print_changes(handle.clone()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("natter: type `help` for commands");
    loop {
        let Some(line) = lines.next_line().await? else {
            log::info!("stdin closed; running without console");
            std::future::pending::<()>().await;
            break;
        };
        match parse(&line) {
            Ok(Input::Quit) => break,
            Ok(input) => execute(&handle, input).await,
            Err(e) if e.is_empty() => {}
            Err(e) => println!("{}", e),
        }
    }
    printer.abort();
    Ok(())
}

async fn execute(handle: &ServiceHandle, input: Input) {
    match input {
        Input::Scan => handle.start_scan(),
        Input::Stop => handle.stop_scan(),
        Input::Connect(peer) => handle.connect(peer),
        Input::Disconnect(peer) => handle.disconnect(peer),
        Input::Send(peer, text) => {
            if let Err(e) = handle.send_message(peer, text).await {
                println!("! {}", e);
            }
        }
        Input::Peers => {
            let snap = handle.snapshot();
            if snap.peers.is_empty() {
                println!("no peers seen (try scan)");
            }
            for p in &snap.peers {
                let bonded = if p.bonded { " (paired)" } else { "" };
                println!(
                    "  {}  {}{}  seen {}",
                    p.address,
                    p.display_name,
                    bonded,
                    p.last_seen_at.format("%H:%M:%S")
                );
            }
        }
        Input::Chats => {
            let snap = handle.snapshot();
            for c in &snap.conversations {
                let preview = c.last_message().map(|m| m.body.as_str()).unwrap_or("");
                println!("  {} [{} unread] {}", c.title(), c.unread_count, preview);
            }
        }
        Input::Show(peer) => {
            let snap = handle.snapshot();
            match snap.conversation(&peer) {
                Some(c) => {
                    for (i, m) in c.messages.iter().enumerate() {
                        let who = match m.direction {
                            Direction::Sent => "me",
                            Direction::Received => c.title(),
                        };
                        let mark = match m.delivery {
                            DeliveryState::Pending => " …",
                            DeliveryState::Failed => " (failed)",
                            DeliveryState::Delivered => "",
                        };
                        println!(
                            "{:>3} {} {}: {}{}",
                            i + 1,
                            m.timestamp.format("%H:%M"),
                            who,
                            m.body,
                            mark
                        );
                    }
                    handle.mark_read(peer);
                }
                None => println!("no conversation with {}", peer),
            }
        }
        Input::Delete(peer, n) => {
            let snap = handle.snapshot();
            match snap
                .conversation(&peer)
                .and_then(|c| c.messages.get(n - 1))
            {
                Some(m) => handle.delete_message(peer, m.id),
                None => println!("no message {} with {}", n, peer),
            }
        }
        Input::Forget(peer) => handle.delete_conversation(peer),
        Input::Help => println!("{}", HELP),
        Input::Quit => {}
    }
}

async fn print_changes(handle: ServiceHandle) {
    let mut rx = handle.subscribe();
    let mut last = rx.borrow_and_update().clone();
    while rx.changed().await.is_ok() {
        let next = rx.borrow_and_update().clone();
        for line in describe_changes(&last, &next) {
            println!("{}", line);
        }
        last = next;
    }
}

/// Human-readable lines for what changed between two snapshots.
pub fn describe_changes(before: &ChatSnapshot, after: &ChatSnapshot) -> Vec<String> {
    let mut out = Vec::new();
    if before.connection != after.connection {
        match &after.connection {
            ConnectionState::Idle if before.scanning => {}
            state => out.push(format!("* {}", state)),
        }
    }
    if before.radio_error != after.radio_error {
        if let Some(e) = &after.radio_error {
            out.push(format!("! {} (enable the adapter, then scan again)", e));
        }
    }
    if before.scanning && !after.scanning {
        out.push(format!("* scan finished, {} peer(s)", after.peers.len()));
    }
    for p in &after.peers {
        if !before.peers.iter().any(|b| b.address == p.address) {
            out.push(format!("+ {} {}", p.address, p.display_name));
        }
    }
    for conv in &after.conversations {
        let seen = before
            .conversation(&conv.peer)
            .map(|c| c.messages.len())
            .unwrap_or(0);
        for m in conv.messages.iter().skip(seen) {
            if m.direction == Direction::Received {
                out.push(format!("[{}] {}", conv.title(), m.body));
            }
        }
        if let Some(prev) = before.conversation(&conv.peer) {
            for m in &conv.messages {
                let was = prev.message(m.id).map(|p| p.delivery);
                if m.delivery == DeliveryState::Failed && was == Some(DeliveryState::Pending) {
                    let why = m.failure.as_deref().unwrap_or("unknown error");
                    out.push(format!("! not delivered to {}: \"{}\" ({})", conv.title(), m.body, why));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use natter_core::{Conversation, Message};

    #[test]
    fn parses_commands() {
        assert_eq!(parse("scan"), Ok(Input::Scan));
        assert_eq!(
            parse("connect aa:bb"),
            Ok(Input::Connect(PeerAddress::new("AA:BB")))
        );
        assert_eq!(
            parse("send aa:bb hello there "),
            Ok(Input::Send(PeerAddress::new("AA:BB"), "hello there".into()))
        );
        assert_eq!(
            parse("delete AA:BB 2"),
            Ok(Input::Delete(PeerAddress::new("AA:BB"), 2))
        );
        assert!(parse("send aa:bb").is_err());
        assert!(parse("delete aa:bb 0").is_err());
        assert!(parse("connect").is_err());
        assert!(parse("frobnicate").is_err());
        assert_eq!(parse("   "), Err(String::new()));
    }

    #[test]
    fn announces_new_messages_and_failures() {
        let peer = PeerAddress::new("AA:BB");
        let mut conv = Conversation::new(peer.clone());
        let mut pending = Message::outgoing(peer.clone(), "hi", Utc::now());
        conv.messages.push(pending.clone());
        let before = ChatSnapshot {
            conversations: vec![conv.clone()],
            ..ChatSnapshot::default()
        };

        pending.delivery = DeliveryState::Failed;
        pending.failure = Some("not connected".into());
        conv.messages[0] = pending;
        let frame = Message::outgoing(peer.clone(), "yo", Utc::now()).to_frame();
        conv.messages
            .push(Message::incoming(peer.clone(), frame, Utc::now()));
        let after = ChatSnapshot {
            conversations: vec![conv],
            ..ChatSnapshot::default()
        };

        let lines = describe_changes(&before, &after);
        assert!(lines.contains(&"[AA:BB] yo".to_string()));
        assert!(lines.iter().any(|l| l.starts_with("! not delivered")));
    }
}
