use crate::engine::error::IpError;
use crate::engine::{fragment, send_frame, Ipv4Engine};
use crate::firewall::Verdict;
use crate::net::device::{NetDevice, TxPriority};
use crate::net::icmp;
use crate::net::ipv4_header::{self, Ipv4Header, SourceRoute};
use log::debug;
use std::sync::Arc;

impl Ipv4Engine {
    // 転送判定エンジン
    // 検証済みでこのホスト宛てではないデータグラムを次ホップへ送り出す
    // フラグメントは再構築せずフラグメントのまま転送する
    pub(crate) fn forward_frame(
        &mut self,
        frame: Vec<u8>,
        header: Ipv4Header,
        source_route: &SourceRoute,
        in_device: &Arc<dyn NetDevice>,
    ) {
        let icmp_sender = Arc::clone(&self.icmp);
        let mut frame = frame;
        let mut header = header;

        // 1. ファイアウォール判定 (アドレス変換系はフレームを書き換えて返す)
        if let Some(policy) = self.policy.clone() {
            match policy.check(&frame, &header) {
                Verdict::Accept => {}
                Verdict::Deny => {
                    debug!("ファイアウォールが転送を拒否しました: {} -> {}", header.source, header.destination);
                    icmp_sender.send(
                        &frame,
                        icmp::ICMP_DEST_UNREACH,
                        icmp::ICMP_HOST_UNREACH,
                        0,
                        in_device.name(),
                    );
                    self.stats.dropped += 1;
                    return;
                }
                Verdict::Mutate(mutated) => match ipv4_header::validate_frame(&mutated) {
                    Ok((new_header, _)) => {
                        frame = mutated;
                        header = new_header;
                    }
                    Err(e) => {
                        debug!("書き換え後のフレームが検証に失敗しました: {}", e);
                        self.stats.dropped += 1;
                        return;
                    }
                },
            }
        }

        // 2. TTL減算。尽きたら経路解決より先に時間超過で破棄する
        //    (到着時TTL=0も255へ巻き戻さずここで弾く)
        if header.ttl <= 1 {
            icmp_sender.send(
                &frame,
                icmp::ICMP_TIME_EXCEEDED,
                icmp::ICMP_EXC_TTL,
                0,
                in_device.name(),
            );
            self.stats.dropped += 1;
            return;
        }
        header.ttl -= 1;
        frame[8] = header.ttl;
        // 3. ヘッダー変更後はチェックサムを全計算し直す
        ipv4_header::store_checksum(&mut frame, header.header_len());

        // 4. 経路解決 (ソースルートオプションの指定があればそちらの宛先で引く)
        let target = source_route.alt_target.unwrap_or(header.destination);
        let route = match self.router.lookup(target, false) {
            Some(route) => route,
            None => {
                debug!("経路がありません: {}", target);
                icmp_sender.send(
                    &frame,
                    icmp::ICMP_DEST_UNREACH,
                    icmp::ICMP_NET_UNREACH,
                    0,
                    in_device.name(),
                );
                self.stats.dropped += 1;
                return;
            }
        };

        // 5. 厳密ソースルートはゲートウェイ経由を許さない
        if route.gateway.is_some() && source_route.strict {
            icmp_sender.send(
                &frame,
                icmp::ICMP_DEST_UNREACH,
                icmp::ICMP_SR_FAILED,
                0,
                in_device.name(),
            );
            self.stats.dropped += 1;
            return;
        }

        // 6. ゲートウェイ経由なら、ゲートウェイ自身への直結経路を解決する
        //    (ゲートウェイをさらにゲートウェイ経由にはしない)
        let route_modified = route.modified;
        let (out_device, next_hop) = match route.gateway {
            Some(gateway) => match self.router.lookup(gateway, true) {
                Some(gateway_route) => (gateway_route.device, gateway),
                None => {
                    debug!("ゲートウェイへの経路がありません: {}", gateway);
                    icmp_sender.send(
                        &frame,
                        icmp::ICMP_DEST_UNREACH,
                        icmp::ICMP_HOST_UNREACH,
                        0,
                        in_device.name(),
                    );
                    self.stats.dropped += 1;
                    return;
                }
            },
            None => (route.device, target),
        };

        // 7. 入ってきたデバイスへ折り返す動的経路なら送信元へリダイレクトを
        //    助言する。転送自体はそのまま続行する
        if out_device.name() == in_device.name() && route_modified {
            if let Some(network) = out_device.network() {
                if network.contains(header.source) && network.contains(target) {
                    icmp_sender.send(
                        &frame,
                        icmp::ICMP_REDIRECT,
                        icmp::ICMP_REDIR_HOST,
                        u32::from(next_hop),
                        in_device.name(),
                    );
                }
            }
        }

        // 8. 停止中のデバイスへは何もせず破棄する
        if !out_device.is_up() {
            debug!("送信デバイスが停止しています: {}", out_device.name());
            self.stats.dropped += 1;
            return;
        }

        // 9-10. MTUに収まらなければフラグメント化し、収まれば直接キューへ
        let priority = TxPriority::from_tos(header.tos);
        if frame.len() > out_device.mtu() {
            match fragment::fragment_datagram(&frame, &header, out_device.mtu()) {
                Ok(fragments) => {
                    for fragment in fragments {
                        send_frame(&out_device, fragment, next_hop, priority);
                        self.stats.fragments_sent += 1;
                    }
                    self.stats.forwarded += 1;
                }
                Err(IpError::FragmentationForbidden { mtu })
                | Err(IpError::MtuTooSmall { mtu }) => {
                    icmp_sender.send(
                        &frame,
                        icmp::ICMP_DEST_UNREACH,
                        icmp::ICMP_FRAG_NEEDED,
                        mtu as u32,
                        in_device.name(),
                    );
                    self.stats.dropped += 1;
                }
                Err(e) => {
                    debug!("フラグメント化に失敗しました: {}", e);
                    self.stats.dropped += 1;
                }
            }
        } else {
            send_frame(&out_device, frame, next_hop, priority);
            self.stats.forwarded += 1;
        }
    }
}
