use dotenv::dotenv;
use tokio::task;

mod engine;
mod error;
mod firewall;
mod net;
mod select_device;
mod setup_logger;

use crate::engine::{EngineConfig, Ipv4Engine};
use crate::error::InitProcessError;
use crate::firewall::{Filter, IpFirewall, Policy};
use crate::net::icmp::IcmpReplier;
use crate::net::pnet_device::PnetDevice;
use crate::net::route::{RouteLookup, StaticRouteTable};
use crate::net::NetDevice;
use crate::select_device::select_device;
use crate::setup_logger::setup_logger;
use ipnetwork::Ipv4Network;
use log::{error, info};
use pnet::datalink::Channel::Ethernet;
use pnet::datalink::{self, MacAddr};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::Packet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::interval;

#[tokio::main]
async fn main() -> Result<(), InitProcessError> {
    dotenv().map_err(|e| InitProcessError::EnvFileReadError(e.to_string()))?;
    setup_logger().map_err(|e| InitProcessError::LoggerError(e.to_string()))?;

    let config = EngineConfig::from_env()?;

    // デバイスの選択
    let interface = select_device()
        .map_err(|e| InitProcessError::DeviceSelectionError(e.to_string()))?;
    info!("デバイスの選択に成功しました: {}", interface.name);

    let mtu = dotenv::var("IP_MTU")
        .unwrap_or_else(|_| "1500".to_string())
        .parse::<usize>()
        .map_err(|e| InitProcessError::EnvVarParseError(e.to_string()))?;
    let neighbor_mac = match dotenv::var("IP_NEIGHBOR_MAC") {
        Ok(value) => Some(
            value
                .parse::<MacAddr>()
                .map_err(|e| InitProcessError::EnvVarParseError(format!("{:?}", e)))?,
        ),
        Err(_) => None,
    };

    let (tx, mut rx) = match datalink::channel(&interface, Default::default()) {
        Ok(Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => {
            return Err(InitProcessError::ChannelOpenError(
                "未対応のチャネルタイプです".to_string(),
            ))
        }
        Err(e) => return Err(InitProcessError::ChannelOpenError(e.to_string())),
    };

    let device = PnetDevice::new(&interface, tx, mtu, neighbor_mac)
        .map_err(InitProcessError::DeviceSelectionError)?;
    let device: Arc<dyn NetDevice> = Arc::new(device);

    // ルーティングテーブルの構築 (デバイスの直結サブネット + 環境変数の静的経路)
    let mut table = StaticRouteTable::new();
    if let Some(network) = device.network() {
        table.add_route(network, None, Arc::clone(&device));
    }
    if let Ok(routes) = dotenv::var("IP_ROUTES") {
        for entry in routes.split(',').filter(|s| !s.trim().is_empty()) {
            let (network_part, gateway_part) = match entry.split_once('=') {
                Some((network, gateway)) => (network, Some(gateway)),
                None => (entry, None),
            };
            let network = network_part
                .trim()
                .parse::<Ipv4Network>()
                .map_err(|e| InitProcessError::EnvVarParseError(e.to_string()))?;
            let gateway = gateway_part
                .map(|g| g.trim().parse::<Ipv4Addr>())
                .transpose()
                .map_err(|e| InitProcessError::EnvVarParseError(e.to_string()))?;
            table.add_route(network, gateway, Arc::clone(&device));
        }
    }
    let router: Arc<dyn RouteLookup> = Arc::new(table);

    let icmp = Arc::new(IcmpReplier::new(Arc::clone(&router)));
    let mut engine = Ipv4Engine::new(config, Arc::clone(&router), icmp);

    // 転送ファイアウォールの構築 (任意)
    if let Ok(policy) = dotenv::var("IP_FW_POLICY") {
        let policy = match policy.to_ascii_lowercase().as_str() {
            "whitelist" => Policy::Whitelist,
            "blacklist" => Policy::Blacklist,
            other => {
                return Err(InitProcessError::EnvVarParseError(format!(
                    "不明なファイアウォールポリシー: {}",
                    other
                )))
            }
        };
        let mut firewall = IpFirewall::new(policy);
        if let Ok(rules) = dotenv::var("IP_FW_RULES") {
            // 形式: "ip:192.168.1.1,proto:6"
            for rule in rules.split(',').filter(|s| !s.trim().is_empty()) {
                let parts: Vec<&str> = rule.trim().split(':').collect();
                match parts.as_slice() {
                    ["ip", addr] => firewall.add_rule(Filter::IpAddress(
                        addr.parse().map_err(|e: std::net::AddrParseError| {
                            InitProcessError::EnvVarParseError(e.to_string())
                        })?,
                    )),
                    ["proto", protocol] => firewall.add_rule(Filter::Protocol(
                        protocol.parse().map_err(|e: std::num::ParseIntError| {
                            InitProcessError::EnvVarParseError(e.to_string())
                        })?,
                    )),
                    _ => {
                        return Err(InitProcessError::EnvVarParseError(format!(
                            "不正なファイアウォールルール: {}",
                            rule
                        )))
                    }
                }
            }
        }
        engine.set_policy(Arc::new(firewall));
    }

    let engine = Arc::new(Mutex::new(engine));

    // リアセンブリタイムアウトの監視
    {
        let engine = Arc::clone(&engine);
        task::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                engine.lock().await.expire_reassembly(Instant::now());
            }
        });
    }

    // 統計の定期出力
    {
        let engine = Arc::clone(&engine);
        task::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let stats = engine.lock().await.stats().clone();
                info!(
                    "統計 - 受信: {}, 配送: {}, 転送: {}, 再構築: {}, 分割送信: {}, 破棄: {}",
                    stats.received,
                    stats.delivered,
                    stats.forwarded,
                    stats.reassembled,
                    stats.fragments_sent,
                    stats.dropped
                );
            }
        });
    }

    // 受信ループ (ブロッキングのキャプチャをワーカースレッドで回す)
    info!("受信ループを開始します: {}", device.name());
    let capture_engine = Arc::clone(&engine);
    let capture_device = Arc::clone(&device);
    let capture = task::spawn_blocking(move || loop {
        match rx.next() {
            Ok(frame) => {
                if let Some(ethernet) = EthernetPacket::new(frame) {
                    if ethernet.get_ethertype() == EtherTypes::Ipv4 {
                        capture_engine
                            .blocking_lock()
                            .ip_receive(ethernet.payload(), &capture_device);
                    }
                }
            }
            Err(e) => error!("フレームの読み取り中にエラーが発生しました: {}", e),
        }
    });

    if let Err(e) = capture.await {
        error!("受信タスクが異常終了しました: {}", e);
    }

    Ok(())
}
