pub mod config;
pub mod deliver;
pub mod error;
pub mod fragment;
pub mod forward;
pub mod reassembly;
pub mod transmit;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::EngineConfig;
pub use error::{IpError, IpResult};
pub use transmit::{SockOpts, TransmitMode};

use crate::engine::deliver::{LocalDelivery, ProtocolHandler, RawSink};
use crate::engine::reassembly::Reassembler;
use crate::firewall::ForwardPolicy;
use crate::net::device::{HeaderBuildResult, NetDevice, OutFrame, TxPriority};
use crate::net::icmp::{self, IcmpSender};
use crate::net::ipv4_header::{self, HeaderError, Ipv4Header};
use crate::net::route::RouteLookup;
use log::{debug, info};
use rand::Rng;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

// 宛先の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DestClass {
    Local,
    Broadcast,
    Multicast { joined: bool },
    Remote,
}

// 処理件数の集計
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    pub received: u64,
    pub delivered: u64,
    pub forwarded: u64,
    pub fragments_sent: u64,
    pub reassembled: u64,
    pub dropped: u64,
}

// IPv4受信・リアセンブリ・転送・送信エンジン
//
// すべての可変状態 (リアセンブリキュー、識別子カウンター、統計) は
// この構造体が所有し、呼び出し側が単一のロックで直列化する。
// どの操作もブロックせず、受信イベントまたはタイマーティックから
// 完走するハンドラーとして実行される。
pub struct Ipv4Engine {
    pub(crate) config: EngineConfig,
    pub(crate) reassembler: Reassembler,
    pub(crate) delivery: LocalDelivery,
    pub(crate) router: Arc<dyn RouteLookup>,
    pub(crate) icmp: Arc<dyn IcmpSender>,
    pub(crate) policy: Option<Arc<dyn ForwardPolicy>>,
    pub(crate) next_id: u16,
    pub(crate) stats: EngineStats,
}

impl Ipv4Engine {
    pub fn new(
        config: EngineConfig,
        router: Arc<dyn RouteLookup>,
        icmp: Arc<dyn IcmpSender>,
    ) -> Self {
        let reassembler = Reassembler::new(
            config.reassembly_timeout(),
            config.max_reassembly_entries,
        );
        info!(
            "IPv4エンジンを初期化しました (転送: {}, リアセンブリタイムアウト: {}秒)",
            config.forwarding_enabled, config.reassembly_timeout_secs
        );
        Self {
            config,
            reassembler,
            delivery: LocalDelivery::new(),
            router,
            icmp,
            policy: None,
            // 識別子カウンターは乱数で初期化する
            next_id: rand::thread_rng().gen(),
            stats: EngineStats::default(),
        }
    }

    pub fn set_policy(&mut self, policy: Arc<dyn ForwardPolicy>) {
        self.policy = Some(policy);
    }

    pub fn register_handler(&mut self, handler: Arc<dyn ProtocolHandler>) {
        self.delivery.register_handler(handler);
    }

    pub fn register_raw_sink(&mut self, sink: Arc<dyn RawSink>) {
        self.delivery.register_raw_sink(sink);
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    // リンク層ヘッダーを剥がした受信フレームのエントリポイント
    pub fn ip_receive(&mut self, frame: &[u8], device: &Arc<dyn NetDevice>) {
        self.ip_receive_at(frame, device, Instant::now());
    }

    pub fn ip_receive_at(&mut self, frame: &[u8], device: &Arc<dyn NetDevice>, now: Instant) {
        self.stats.received += 1;

        let (header, source_route) = match ipv4_header::validate_frame(frame) {
            Ok(parsed) => parsed,
            Err(HeaderError::BadOption { pointer }) => {
                // 不正なオプションのみICMPパラメータ異常で応答する
                debug!("不正なオプションを持つフレームを破棄します (オフセット: {})", pointer);
                self.icmp.send(
                    frame,
                    icmp::ICMP_PARAMETERPROB,
                    0,
                    (pointer as u32) << 24,
                    device.name(),
                );
                self.stats.dropped += 1;
                return;
            }
            Err(e) => {
                // 形式不正は黙って破棄する
                debug!("ヘッダー検証に失敗したフレームを破棄します: {}", e);
                self.stats.dropped += 1;
                return;
            }
        };

        // リンク層のパディングを除いてtotal_lengthちょうどに切り詰める
        let frame = &frame[..header.total_length as usize];

        match self.classify(header.destination, device) {
            DestClass::Local => {
                self.receive_local(frame, &header, device.name(), false, now);
            }
            DestClass::Broadcast => {
                // ブロードキャストは決して転送しない
                self.receive_local(frame, &header, device.name(), true, now);
            }
            DestClass::Multicast { joined } => {
                if joined {
                    self.receive_local(frame, &header, device.name(), true, now);
                } else {
                    debug!("未参加のマルチキャストグループ宛てを破棄します: {}", header.destination);
                    self.stats.dropped += 1;
                }
            }
            DestClass::Remote => {
                if self.config.forwarding_enabled {
                    self.forward_frame(frame.to_vec(), header, &source_route, device);
                } else {
                    debug!("転送が無効のため破棄します: {}", header.destination);
                    self.stats.dropped += 1;
                }
            }
        }
    }

    // このホスト宛てのフレーム: 必要ならリアセンブリしてから配送する
    fn receive_local(
        &mut self,
        frame: &[u8],
        header: &Ipv4Header,
        device_name: &str,
        is_broadcast: bool,
        now: Instant,
    ) {
        if header.is_fragment() {
            let datagram =
                match self
                    .reassembler
                    .process_fragment(frame, header, device_name, now)
                {
                    Some(datagram) => datagram,
                    None => return,
                };
            self.stats.reassembled += 1;

            // 結合済みデータグラムのヘッダーで配送する
            match Ipv4Header::parse(&datagram) {
                Some(glued) => self.deliver_datagram(datagram, &glued, device_name, is_broadcast),
                None => self.stats.dropped += 1,
            }
        } else {
            // 同じキーの古いリアセンブリキューは新しい完全な
            // データグラムに属し得ないため破棄する
            self.reassembler.drop_stale(header);
            self.deliver_datagram(frame.to_vec(), header, device_name, is_broadcast);
        }
    }

    fn deliver_datagram(
        &mut self,
        datagram: Vec<u8>,
        header: &Ipv4Header,
        device_name: &str,
        is_broadcast: bool,
    ) {
        self.stats.delivered += 1;
        let icmp = Arc::clone(&self.icmp);
        self.delivery
            .deliver(datagram, header, device_name, is_broadcast, &*icmp);
    }

    // 送信パスからのループバック配送 (ブロードキャスト/マルチキャスト複製)
    pub(crate) fn loopback_frame(&mut self, frame: Vec<u8>, now: Instant) {
        if let Ok((header, _)) = ipv4_header::validate_frame(&frame) {
            self.receive_local(&frame, &header, "lo", true, now);
        }
    }

    // タイマーティック: 期限切れリアセンブリキューの破棄
    pub fn expire_reassembly(&mut self, now: Instant) {
        let icmp = Arc::clone(&self.icmp);
        self.reassembler.expire_stale(now, &*icmp);
    }

    fn classify(&self, destination: Ipv4Addr, device: &Arc<dyn NetDevice>) -> DestClass {
        if destination.is_loopback()
            || destination == device.addr()
            || self.config.local_addrs.contains(&destination)
        {
            return DestClass::Local;
        }
        if destination == Ipv4Addr::BROADCAST {
            return DestClass::Broadcast;
        }
        if let Some(network) = device.network() {
            if destination == network.broadcast() {
                return DestClass::Broadcast;
            }
        }
        if destination.is_multicast() {
            return DestClass::Multicast {
                joined: self.config.multicast_groups.contains(&destination),
            };
        }
        DestClass::Remote
    }

    pub(crate) fn next_identification(&mut self) -> u16 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }
}

// リンク層ヘッダーを構築してデバイスの送信キューへ入れる
// Deferred (ARP解決待ち) の場合は未解決の印を付けたままキューに乗せる
pub(crate) fn send_frame(
    device: &Arc<dyn NetDevice>,
    datagram: Vec<u8>,
    next_hop: Ipv4Addr,
    priority: TxPriority,
) {
    let mut data = datagram;
    let hw_resolved = match device.build_header(&mut data, next_hop) {
        HeaderBuildResult::Built(_) => true,
        HeaderBuildResult::Deferred => false,
    };
    device.queue_frame(OutFrame { data, hw_resolved }, priority);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{
        make_fragment_frames, make_frame, RecordingHandler, RecordingIcmp, TestDevice,
    };
    use crate::net::route::StaticRouteTable;
    use ipnetwork::Ipv4Network;
    use std::time::Duration;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const REMOTE_SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const REMOTE_DST: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 5);

    struct Fixture {
        engine: Ipv4Engine,
        in_device: Arc<dyn NetDevice>,
        in_device_raw: Arc<TestDevice>,
        out_device: Arc<TestDevice>,
        icmp: Arc<RecordingIcmp>,
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn fixture_with(adjust: impl FnOnce(&mut EngineConfig)) -> Fixture {
        let in_device = Arc::new(TestDevice::new("eth0", 1500, LOCAL, 24));
        let out_device = Arc::new(TestDevice::new(
            "eth1",
            1500,
            Ipv4Addr::new(172, 16, 0, 1),
            16,
        ));

        let mut table = StaticRouteTable::new();
        table.add_route(
            Ipv4Network::new(Ipv4Addr::new(172, 16, 0, 0), 16).unwrap(),
            None,
            out_device.clone() as Arc<dyn NetDevice>,
        );
        table.add_route(
            Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 0), 24).unwrap(),
            None,
            in_device.clone() as Arc<dyn NetDevice>,
        );

        let icmp = Arc::new(RecordingIcmp::new());
        let mut config = EngineConfig::for_testing();
        config.local_addrs = vec![LOCAL];
        adjust(&mut config);

        let engine = Ipv4Engine::new(
            config,
            Arc::new(table) as Arc<dyn RouteLookup>,
            icmp.clone() as Arc<dyn IcmpSender>,
        );

        Fixture {
            engine,
            in_device: in_device.clone() as Arc<dyn NetDevice>,
            in_device_raw: in_device,
            out_device,
            icmp,
        }
    }

    #[test]
    fn test_local_datagram_is_delivered() {
        let mut f = fixture();
        let handler = Arc::new(RecordingHandler::new(17));
        f.engine.register_handler(handler.clone());

        let frame = make_frame(REMOTE_SRC, LOCAL, 1, 17, 64, 0, 0, &[1, 2, 3]);
        f.engine.ip_receive(&frame, &f.in_device);

        assert_eq!(handler.received_count(), 1);
        assert_eq!(f.engine.stats().delivered, 1);
    }

    #[test]
    fn test_local_fragments_are_reassembled_before_delivery() {
        let mut f = fixture();
        let handler = Arc::new(RecordingHandler::new(17));
        f.engine.register_handler(handler.clone());

        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let frames = make_fragment_frames(REMOTE_SRC, LOCAL, 0x0A0A, &payload, 1480);

        for frame in &frames {
            f.engine.ip_receive(&frame, &f.in_device);
        }

        assert_eq!(handler.received_count(), 1, "完成後にちょうど1回配送されます");
        let received = handler.last_received().unwrap();
        assert_eq!(&received[20..], &payload[..]);
        assert_eq!(f.engine.stats().reassembled, 1);
    }

    #[test]
    fn test_remote_datagram_is_forwarded_with_decremented_ttl() {
        let mut f = fixture();
        let frame = make_frame(REMOTE_SRC, REMOTE_DST, 1, 17, 64, 0, 0, &[0u8; 32]);
        f.engine.ip_receive(&frame, &f.in_device);

        let sent = f.out_device.sent_frames();
        assert_eq!(sent.len(), 1);
        let header = Ipv4Header::parse(&sent[0]).unwrap();
        assert_eq!(header.ttl, 63);

        // TTL減算後もチェックサムは正しい
        assert!(crate::net::checksum::verify(&sent[0][..20]));
        assert_eq!(f.engine.stats().forwarded, 1);
    }

    #[test]
    fn test_ttl_one_is_never_forwarded() {
        let mut f = fixture();
        let frame = make_frame(REMOTE_SRC, REMOTE_DST, 1, 17, 1, 0, 0, &[0u8; 8]);
        f.engine.ip_receive(&frame, &f.in_device);

        assert_eq!(f.out_device.sent_count(), 0);
        assert_eq!(f.icmp.sent_count(), 1);
        assert_eq!(
            f.icmp.last_sent(),
            Some((icmp::ICMP_TIME_EXCEEDED, icmp::ICMP_EXC_TTL))
        );
    }

    #[test]
    fn test_ttl_two_is_forwarded_with_ttl_one() {
        let mut f = fixture();
        let frame = make_frame(REMOTE_SRC, REMOTE_DST, 1, 17, 2, 0, 0, &[0u8; 8]);
        f.engine.ip_receive(&frame, &f.in_device);

        let sent = f.out_device.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(Ipv4Header::parse(&sent[0]).unwrap().ttl, 1);
        assert_eq!(f.icmp.sent_count(), 0);
    }

    #[test]
    fn test_ttl_zero_on_arrival_is_rejected_before_routing() {
        // 経路を1本も持たないエンジンでも、TTL切れはNoRouteより先に判定される
        let icmp = Arc::new(RecordingIcmp::new());
        let empty_table = StaticRouteTable::new();
        let mut config = EngineConfig::for_testing();
        config.local_addrs = vec![LOCAL];
        let mut engine = Ipv4Engine::new(
            config,
            Arc::new(empty_table) as Arc<dyn RouteLookup>,
            icmp.clone() as Arc<dyn IcmpSender>,
        );
        let device =
            Arc::new(TestDevice::new("eth0", 1500, LOCAL, 24)) as Arc<dyn NetDevice>;

        let frame = make_frame(REMOTE_SRC, REMOTE_DST, 1, 17, 0, 0, 0, &[0u8; 8]);
        engine.ip_receive(&frame, &device);

        // 経路なしのICMPではなく時間超過が1回だけ送られる (TTLは255へ巻き戻らない)
        assert_eq!(icmp.sent_count(), 1);
        assert_eq!(
            icmp.last_sent(),
            Some((icmp::ICMP_TIME_EXCEEDED, icmp::ICMP_EXC_TTL))
        );
    }

    #[test]
    fn test_no_route_sends_net_unreachable() {
        let mut f = fixture();
        let frame = make_frame(
            REMOTE_SRC,
            Ipv4Addr::new(203, 0, 113, 9),
            1,
            17,
            64,
            0,
            0,
            &[0u8; 8],
        );
        f.engine.ip_receive(&frame, &f.in_device);

        assert_eq!(f.icmp.sent_count(), 1);
        assert_eq!(
            f.icmp.last_sent(),
            Some((icmp::ICMP_DEST_UNREACH, icmp::ICMP_NET_UNREACH))
        );
    }

    #[test]
    fn test_oversized_df_datagram_sends_frag_needed_with_mtu() {
        let mut f = fixture();
        // 出力デバイス(MTU 1500)を超えるDF付きデータグラム
        let payload = vec![0u8; 2000];
        let frame = make_frame(REMOTE_SRC, REMOTE_DST, 1, 17, 64, 0b010, 0, &payload);
        f.engine.ip_receive(&frame, &f.in_device);

        assert_eq!(f.out_device.sent_count(), 0, "DFのデータグラムは分割されません");
        assert_eq!(f.icmp.sent_count(), 1);
        assert_eq!(
            f.icmp.last_sent(),
            Some((icmp::ICMP_DEST_UNREACH, icmp::ICMP_FRAG_NEEDED))
        );
        assert_eq!(f.icmp.last_extra(), Some(1500), "MTUが引用されます");
    }

    #[test]
    fn test_oversized_forward_is_refragmented() {
        let mut f = fixture();
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let frame = make_frame(REMOTE_SRC, REMOTE_DST, 0x1234, 17, 64, 0, 0, &payload);
        f.engine.ip_receive(&frame, &f.in_device);

        let sent = f.out_device.sent_frames();
        assert_eq!(sent.len(), 3);
        for fragment in &sent {
            assert!(fragment.len() <= 1500);
            let header = Ipv4Header::parse(fragment).unwrap();
            assert_eq!(header.identification, 0x1234);
            assert_eq!(header.ttl, 63);
        }
    }

    #[test]
    fn test_broadcast_is_never_forwarded() {
        let mut f = fixture();
        // 受信デバイスのサブネットブロードキャスト宛て
        let frame = make_frame(
            REMOTE_SRC,
            Ipv4Addr::new(10, 0, 0, 255),
            1,
            200,
            64,
            0,
            0,
            &[0u8; 8],
        );
        f.engine.ip_receive(&frame, &f.in_device);

        assert_eq!(f.out_device.sent_count(), 0);
        // 受け取り手がなくてもブロードキャストにはICMPを返さない
        assert_eq!(f.icmp.sent_count(), 0);
    }

    #[test]
    fn test_forwarding_disabled_drops_remote() {
        let mut f = fixture_with(|config| config.forwarding_enabled = false);
        let frame = make_frame(REMOTE_SRC, REMOTE_DST, 1, 17, 64, 0, 0, &[0u8; 8]);
        f.engine.ip_receive(&frame, &f.in_device);

        assert_eq!(f.out_device.sent_count(), 0);
        assert_eq!(f.engine.stats().dropped, 1);
    }

    #[test]
    fn test_malformed_frames_are_silently_dropped() {
        let mut f = fixture();

        // 短すぎるフレーム
        f.engine.ip_receive(&[0u8; 10], &f.in_device);
        // チェックサム不正
        let mut bad = make_frame(REMOTE_SRC, LOCAL, 1, 17, 64, 0, 0, &[0u8; 8]);
        bad[8] = bad[8].wrapping_add(1);
        f.engine.ip_receive(&bad, &f.in_device);

        assert_eq!(f.icmp.sent_count(), 0);
        assert_eq!(f.engine.stats().dropped, 2);
    }

    #[test]
    fn test_malformed_option_sends_parameter_problem() {
        let mut f = fixture();

        let mut frame = make_frame(REMOTE_SRC, LOCAL, 1, 17, 64, 0, 0, &[0u8; 8]);
        // IHL=6へ拡張し、長さの壊れたオプションを差し込む
        frame[0] = 0x46;
        frame.splice(20..20, [0x89u8, 40, 0, 0]);
        let total = frame.len() as u16;
        frame[2..4].copy_from_slice(&total.to_be_bytes());
        ipv4_header::store_checksum(&mut frame, 24);

        f.engine.ip_receive(&frame, &f.in_device);
        assert_eq!(f.icmp.sent_count(), 1);
        assert_eq!(f.icmp.last_sent(), Some((icmp::ICMP_PARAMETERPROB, 0)));
    }

    #[test]
    fn test_reassembly_timeout_via_engine_tick() {
        let mut f = fixture();
        let now = Instant::now();

        let payload = vec![0u8; 2000];
        let frames = make_fragment_frames(REMOTE_SRC, LOCAL, 0x0B0B, &payload, 1000);
        f.engine.ip_receive_at(&frames[0], &f.in_device, now);

        f.engine.expire_reassembly(now + Duration::from_secs(31));
        assert_eq!(f.icmp.sent_count(), 1);
        assert_eq!(
            f.icmp.last_sent(),
            Some((icmp::ICMP_TIME_EXCEEDED, icmp::ICMP_EXC_FRAGTIME))
        );
    }

    #[test]
    fn test_tos_selects_transmit_priority() {
        let mut f = fixture();

        let mut low_delay = make_frame(REMOTE_SRC, REMOTE_DST, 1, 17, 64, 0, 0, &[0u8; 8]);
        low_delay[1] = 0x10;
        ipv4_header::store_checksum(&mut low_delay, 20);
        f.engine.ip_receive(&low_delay, &f.in_device);

        let mut throughput = make_frame(REMOTE_SRC, REMOTE_DST, 2, 17, 64, 0, 0, &[0u8; 8]);
        throughput[1] = 0x08;
        ipv4_header::store_checksum(&mut throughput, 20);
        f.engine.ip_receive(&throughput, &f.in_device);

        let priorities = f.out_device.sent_priorities();
        assert_eq!(
            priorities,
            vec![TxPriority::Interactive, TxPriority::Background]
        );
    }

    #[test]
    fn test_unknown_multicast_group_is_dropped() {
        let mut f = fixture();
        let frame = make_frame(
            REMOTE_SRC,
            Ipv4Addr::new(224, 9, 9, 9),
            1,
            17,
            64,
            0,
            0,
            &[0u8; 8],
        );
        f.engine.ip_receive(&frame, &f.in_device);

        assert_eq!(f.out_device.sent_count(), 0);
        assert_eq!(f.in_device_raw.sent_count(), 0);
        assert_eq!(f.engine.stats().dropped, 1);
    }

    #[test]
    fn test_joined_multicast_group_is_delivered() {
        let mut f = fixture();
        let handler = Arc::new(RecordingHandler::new(17));
        f.engine.register_handler(handler.clone());

        let frame = make_frame(
            REMOTE_SRC,
            Ipv4Addr::new(224, 0, 1, 1),
            1,
            17,
            64,
            0,
            0,
            &[0u8; 8],
        );
        f.engine.ip_receive(&frame, &f.in_device);
        assert_eq!(handler.received_count(), 1);
    }
}
