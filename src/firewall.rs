use crate::net::ipv4_header::Ipv4Header;
use std::collections::HashSet;
use std::net::Ipv4Addr;

// 転送ポリシーの判定結果
// Mutateはアドレス変換系のコラボレーターが書き換えたフレームを返すためにある
pub enum Verdict {
    Accept,
    Deny,
    Mutate(Vec<u8>),
}

// 転送経路のファイアウォール (外部コラボレーター)
pub trait ForwardPolicy: Send + Sync {
    fn check(&self, frame: &[u8], header: &Ipv4Header) -> Verdict;
}

#[derive(Debug, Eq, Hash, PartialEq)]
pub enum Filter {
    IpAddress(Ipv4Addr),
    Protocol(u8),
}

#[derive(Debug)]
pub enum Policy {
    Whitelist,
    Blacklist,
}

// ルール一致 + ポリシーで許可/拒否を決める単純なファイアウォール
#[derive(Debug)]
pub struct IpFirewall {
    rules: HashSet<Filter>,
    policy: Policy,
}

impl IpFirewall {
    pub fn new(policy: Policy) -> Self {
        Self {
            rules: HashSet::new(),
            policy,
        }
    }

    pub fn add_rule(&mut self, filter: Filter) {
        self.rules.insert(filter);
    }

    fn matched(&self, header: &Ipv4Header) -> bool {
        self.rules.iter().any(|filter| match filter {
            Filter::IpAddress(ip) => header.source == *ip || header.destination == *ip,
            Filter::Protocol(protocol) => header.protocol == *protocol,
        })
    }
}

impl ForwardPolicy for IpFirewall {
    fn check(&self, _frame: &[u8], header: &Ipv4Header) -> Verdict {
        let hit = self.matched(header);
        match self.policy {
            Policy::Whitelist => {
                if hit {
                    Verdict::Accept
                } else {
                    Verdict::Deny
                }
            }
            Policy::Blacklist => {
                if hit {
                    Verdict::Deny
                } else {
                    Verdict::Accept
                }
            }
        }
    }
}
