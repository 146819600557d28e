use crate::net::device::{HeaderBuildResult, NetDevice, OutFrame, TxPriority};
use ipnetwork::Ipv4Network;
use log::{error, warn};
use pnet::datalink::{DataLinkSender, MacAddr, NetworkInterface};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

const ETHERNET_HEADER_LEN: usize = 14;

// pnetのデータリンクチャネルで実デバイスへ送信するNetDevice実装
//
// ARPは実装していないため、ユニキャストの宛先MACは環境変数で
// 与えられたネイバーMACを使う。未指定の場合はDeferredを返し、
// フレームは未解決のまま破棄される
pub struct PnetDevice {
    name: String,
    mtu: usize,
    addr: Ipv4Addr,
    network: Option<Ipv4Network>,
    mac: MacAddr,
    neighbor_mac: Option<MacAddr>,
    tx: Mutex<Box<dyn DataLinkSender>>,
}

impl PnetDevice {
    pub fn new(
        interface: &NetworkInterface,
        tx: Box<dyn DataLinkSender>,
        mtu: usize,
        neighbor_mac: Option<MacAddr>,
    ) -> Result<Self, String> {
        let network = interface
            .ips
            .iter()
            .find_map(|ip| match (ip.ip(), ip.prefix()) {
                (IpAddr::V4(addr), prefix) => Ipv4Network::new(addr, prefix).ok(),
                _ => None,
            });
        let addr = network
            .map(|network| network.ip())
            .ok_or_else(|| format!("デバイスにIPv4アドレスがありません: {}", interface.name))?;
        let mac = interface
            .mac
            .ok_or_else(|| format!("デバイスのMACアドレスが不明です: {}", interface.name))?;

        Ok(Self {
            name: interface.name.clone(),
            mtu,
            addr,
            network,
            mac,
            neighbor_mac,
            tx: Mutex::new(tx),
        })
    }

    // 宛先IPからイーサネットの宛先MACを決める
    fn dest_mac(&self, dest: Ipv4Addr) -> Option<MacAddr> {
        if dest == Ipv4Addr::BROADCAST
            || self.network.map_or(false, |network| network.broadcast() == dest)
        {
            return Some(MacAddr::broadcast());
        }
        if dest.is_multicast() {
            // 01:00:5e + グループアドレスの下位23ビット (RFC 1112)
            let octets = dest.octets();
            return Some(MacAddr::new(
                0x01,
                0x00,
                0x5e,
                octets[1] & 0x7f,
                octets[2],
                octets[3],
            ));
        }
        self.neighbor_mac
    }
}

impl NetDevice for PnetDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn is_up(&self) -> bool {
        true
    }

    fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    fn network(&self) -> Option<Ipv4Network> {
        self.network
    }

    fn build_header(&self, frame: &mut Vec<u8>, dest: Ipv4Addr) -> HeaderBuildResult {
        let dest_mac = match self.dest_mac(dest) {
            Some(mac) => mac,
            None => return HeaderBuildResult::Deferred,
        };

        let mut buffer = vec![0u8; ETHERNET_HEADER_LEN + frame.len()];
        buffer[ETHERNET_HEADER_LEN..].copy_from_slice(frame);
        if let Some(mut ethernet) = MutableEthernetPacket::new(&mut buffer[..ETHERNET_HEADER_LEN]) {
            ethernet.set_destination(dest_mac);
            ethernet.set_source(self.mac);
            ethernet.set_ethertype(EtherTypes::Ipv4);
        }
        *frame = buffer;
        HeaderBuildResult::Built(ETHERNET_HEADER_LEN)
    }

    fn queue_frame(&self, frame: OutFrame, _priority: TxPriority) {
        if !frame.hw_resolved {
            warn!(
                "宛先MACが未解決のためフレームを破棄します (デバイス: {})",
                self.name
            );
            return;
        }

        let mut tx = match self.tx.lock() {
            Ok(tx) => tx,
            Err(poisoned) => poisoned.into_inner(),
        };
        match tx.send_to(&frame.data, None) {
            Some(Ok(_)) => {}
            Some(Err(e)) => error!("フレーム送信に失敗しました: {}", e),
            None => warn!("宛先が指定されていないため送信をスキップしました"),
        }
    }
}
