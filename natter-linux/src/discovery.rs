//! LAN discovery: UDP multicast adverts out, sightings in.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use natter_core::wire::{decode_frame, encode_frame};
use natter_core::{Advert, LinkError, PeerAddress, Sighting, PROTOCOL_VERSION};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::radio::LocalIdentity;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const ADVERT_INTERVAL: Duration = Duration::from_secs(2);
const MAX_ADVERT_LEN: u32 = 1024;

/// Periodically announce ourselves so scanning peers can find and dial us.
pub async fn advertise_loop(identity: LocalIdentity, discovery_port: u16, link_port: u16) {
    let advert = Advert {
        protocol_version: PROTOCOL_VERSION,
        address: identity.address,
        display_name: identity.display_name,
        link_port,
    };
    let frame = match encode_frame(&advert) {
        Ok(f) => f,
        Err(e) => {
            log::error!("Cannot encode advert: {}", e);
            return;
        }
    };
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(s) => s,
        Err(e) => {
            log::error!("Cannot open advert socket: {}", e);
            return;
        }
    };
    if let Err(e) = socket.set_multicast_ttl_v4(1) {
        log::warn!("Cannot limit advert TTL: {}", e);
    }
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));
    let mut failing = false;
    loop {
        match socket.send_to(&frame, dest).await {
            Ok(_) if failing => {
                log::info!("Adverts flowing again");
                failing = false;
            }
            Ok(_) => {}
            Err(e) if !failing => {
                log::warn!("Advert send failed: {}", e);
                failing = true;
            }
            Err(_) => {}
        }
        tokio::time::sleep(ADVERT_INTERVAL).await;
    }
}

/// Readiness check: is there a route to the multicast group at all?
pub fn check_route(discovery_port: u16) -> Result<(), LinkError> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(radio_error)?;
    socket
        .connect((MULTICAST_GROUP, discovery_port))
        .map_err(radio_error)?;
    Ok(())
}

/// Listen for adverts until the caller drops this future. Each valid advert from another
/// device updates `known` (so `connect` can find it) and is pushed as a sighting.
pub async fn scan(
    own_address: &PeerAddress,
    discovery_port: u16,
    static_peers: &HashMap<PeerAddress, SocketAddr>,
    known: Arc<Mutex<HashMap<PeerAddress, SocketAddr>>>,
    sightings: mpsc::Sender<Sighting>,
) -> Result<(), LinkError> {
    let socket =
        make_multicast_socket(discovery_port).map_err(|e| bind_error(e, discovery_port))?;
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await.map_err(radio_error)?;
        let advert = match decode_frame::<Advert>(&buf[..n], MAX_ADVERT_LEN) {
            Ok((advert, _)) => advert,
            Err(e) => {
                log::debug!("Ignoring datagram from {}: {}", from, e);
                continue;
            }
        };
        if advert.protocol_version != PROTOCOL_VERSION || &advert.address == own_address {
            continue;
        }
        let endpoint = SocketAddr::new(from.ip(), advert.link_port);
        known.lock().await.insert(advert.address.clone(), endpoint);
        let sighting = Sighting {
            bonded: static_peers.contains_key(&advert.address),
            address: advert.address,
            display_name: advert.display_name,
        };
        if sightings.send(sighting).await.is_err() {
            return Ok(());
        }
    }
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn radio_error(e: std::io::Error) -> LinkError {
    LinkError::PermissionOrRadio(e.to_string())
}

/// A busy port means another program (often a second natter) holds it, not a radio problem.
fn bind_error(e: std::io::Error, port: u16) -> LinkError {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => LinkError::SocketIo(format!(
            "discovery port {} is in use by another program",
            port
        )),
        _ => radio_error(e),
    }
}
