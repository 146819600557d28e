use crate::engine::error::{IpError, IpResult};
use crate::engine::{fragment, send_frame, Ipv4Engine};
use crate::net::device::TxPriority;
use crate::net::ipv4_header::{self, HeaderError, Ipv4Header, FLAG_DF, FLAG_MF, MIN_HEADER_LEN};
use log::debug;
use std::net::Ipv4Addr;
use std::time::Instant;

// 送信モード
// 再送 (NoNewIdentifier) では既存の識別子を決して振り直さない。
// Retainのバッファ保持自体はトランスポート層の責務であり、
// ここでは識別子の扱いのみが異なる
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitMode {
    FreeAfterSend,
    Retain,
    NoNewIdentifier,
}

// 送信元ソケットのオプション (カーネル生成のデータグラムでは省略される)
#[derive(Debug, Clone)]
pub struct SockOpts {
    pub source: Option<Ipv4Addr>,
    pub ttl: u8,
    pub tos: u8,
    pub multicast_ttl: u8,
    pub multicast_loop: bool,
}

impl Default for SockOpts {
    fn default() -> Self {
        Self {
            source: None,
            ttl: 64,
            tos: 0,
            multicast_ttl: 1,
            multicast_loop: true,
        }
    }
}

impl Ipv4Engine {
    // 構築済みデータグラムの送信 (ip_queue_xmit相当)
    pub fn ip_queue_xmit(
        &mut self,
        sock: Option<&SockOpts>,
        datagram: Vec<u8>,
        mode: TransmitMode,
    ) -> IpResult<()> {
        let mut datagram = datagram;
        let mut header =
            Ipv4Header::parse(&datagram).ok_or(IpError::Header(HeaderError::TooShort))?;
        if header.total_length as usize != datagram.len() {
            return Err(IpError::Header(HeaderError::LengthMismatch {
                total_length: header.total_length,
                actual: datagram.len(),
            }));
        }

        // 新規データグラムにのみ新しい識別子を割り当てる
        if mode != TransmitMode::NoNewIdentifier {
            header.identification = self.next_identification();
            datagram[4..6].copy_from_slice(&header.identification.to_be_bytes());
        }
        ipv4_header::store_checksum(&mut datagram, header.header_len());

        let route = self
            .router
            .lookup(header.destination, false)
            .ok_or(IpError::NoRoute(header.destination))?;
        if !route.device.is_up() {
            return Err(IpError::DeviceDown(route.device.name().to_string()));
        }
        let device = route.device;
        let next_hop = route.gateway.unwrap_or(header.destination);
        let priority = TxPriority::from_tos(header.tos);

        let is_broadcast = header.destination == Ipv4Addr::BROADCAST
            || device
                .network()
                .map_or(false, |network| network.broadcast() == header.destination);
        let is_multicast = header.destination.is_multicast();

        if is_broadcast || is_multicast {
            // 自サブネット宛てのブロードキャスト/マルチキャストは
            // ローカルの受信者にも見えるよう複製を配送する
            let loop_enabled =
                !is_multicast || sock.map(|opts| opts.multicast_loop).unwrap_or(true);
            if loop_enabled {
                self.loopback_frame(datagram.clone(), Instant::now());
            }
            // TTL 0のマルチキャストはワイヤに出さない
            if is_multicast && header.ttl == 0 {
                return Ok(());
            }
        }

        if datagram.len() > device.mtu() {
            let fragments = fragment::fragment_datagram(&datagram, &header, device.mtu())?;
            for fragment in fragments {
                send_frame(&device, fragment, next_hop, priority);
                self.stats.fragments_sent += 1;
            }
        } else {
            send_frame(&device, datagram, next_hop, priority);
        }
        Ok(())
    }

    // ヘッダー構築とペイロード充填を伴う送信 (ip_build_xmit相当)
    //
    // fillは各チャンクのペイロード領域とペイロード内オフセットを受け取る。
    // 低速パスはチャンクを最大オフセットから0へ向かって構築する:
    // 最初に作られる最大オフセットのチャンクだけがMFを持たず、
    // 全長を知る最終フラグメントの慣例を最初の充填で確定できる
    pub fn ip_build_xmit(
        &mut self,
        sock: Option<&SockOpts>,
        fill: &mut dyn FnMut(&mut [u8], usize),
        payload_len: usize,
        destination: Ipv4Addr,
        dont_fragment: bool,
        protocol: u8,
    ) -> IpResult<()> {
        let total = MIN_HEADER_LEN + payload_len;
        if total > 65535 {
            return Err(IpError::PayloadTooLong(payload_len));
        }

        let route = self
            .router
            .lookup(destination, false)
            .ok_or(IpError::NoRoute(destination))?;
        if !route.device.is_up() {
            return Err(IpError::DeviceDown(route.device.name().to_string()));
        }
        let device = route.device;
        let next_hop = route.gateway.unwrap_or(destination);
        let mtu = device.mtu();

        let is_broadcast = destination == Ipv4Addr::BROADCAST
            || device
                .network()
                .map_or(false, |network| network.broadcast() == destination);
        let is_multicast = destination.is_multicast();

        let source = sock
            .and_then(|opts| opts.source)
            .unwrap_or_else(|| device.addr());
        let tos = sock.map(|opts| opts.tos).unwrap_or(0);
        let ttl = if is_multicast {
            sock.map(|opts| opts.multicast_ttl).unwrap_or(1)
        } else {
            sock.map(|opts| opts.ttl).unwrap_or(self.config.default_ttl)
        };
        let priority = TxPriority::from_tos(tos);

        // 高速パス: 1バッファに収まり、ループバック複製も不要な場合
        if total <= mtu && !is_broadcast && !is_multicast {
            let header = Ipv4Header {
                version: 4,
                ihl: 5,
                tos,
                total_length: total as u16,
                identification: self.next_identification(),
                flags: if dont_fragment { FLAG_DF } else { 0 },
                fragment_offset: 0,
                ttl,
                protocol,
                checksum: 0,
                source,
                destination,
            };

            let mut buffer = vec![0u8; total];
            header.write_to(&mut buffer);
            fill(&mut buffer[MIN_HEADER_LEN..], 0);
            ipv4_header::store_checksum(&mut buffer, MIN_HEADER_LEN);

            send_frame(&device, buffer, next_hop, priority);
            return Ok(());
        }

        // 低速パス
        if dont_fragment && total > mtu {
            return Err(IpError::FragmentationForbidden { mtu });
        }
        let usable = if mtu > MIN_HEADER_LEN {
            (mtu - MIN_HEADER_LEN) & !7
        } else {
            0
        };
        if usable < 8 {
            return Err(IpError::MtuTooSmall { mtu });
        }

        let identification = self.next_identification();
        let loop_enabled = (is_broadcast || is_multicast)
            && (!is_multicast || sock.map(|opts| opts.multicast_loop).unwrap_or(true));

        let offsets: Vec<usize> = if payload_len == 0 {
            vec![0]
        } else {
            (0..payload_len).step_by(usable).collect()
        };
        let chunk_count = offsets.len();

        for &offset in offsets.iter().rev() {
            let chunk_len = usable.min(payload_len - offset);
            let more = offset + chunk_len < payload_len;

            // 呼び出し側のDF指定はチャンクにも引き継ぐ
            // (複数チャンクになるDFは上で弾いているので単一チャンクのみ通る)
            let flags =
                (if dont_fragment { FLAG_DF } else { 0 }) | (if more { FLAG_MF } else { 0 });
            let header = Ipv4Header {
                version: 4,
                ihl: 5,
                tos,
                total_length: (MIN_HEADER_LEN + chunk_len) as u16,
                identification,
                flags,
                fragment_offset: (offset / 8) as u16,
                ttl,
                protocol,
                checksum: 0,
                source,
                destination,
            };

            let mut buffer = vec![0u8; MIN_HEADER_LEN + chunk_len];
            header.write_to(&mut buffer);
            fill(&mut buffer[MIN_HEADER_LEN..], offset);
            ipv4_header::store_checksum(&mut buffer, MIN_HEADER_LEN);

            if loop_enabled {
                self.loopback_frame(buffer.clone(), Instant::now());
            }
            if is_multicast && ttl == 0 {
                // ループバックのみで、ワイヤには出さない
                continue;
            }

            send_frame(&device, buffer, next_hop, priority);
            if chunk_count > 1 {
                self.stats.fragments_sent += 1;
            }
        }

        if chunk_count > 1 {
            debug!(
                "{}バイトのペイロードを{}個のフラグメントで送信しました",
                payload_len, chunk_count
            );
        }

        Ok(())
    }
}
