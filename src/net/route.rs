use crate::net::device::NetDevice;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::sync::Arc;

// ルーティング検索の結果
#[derive(Clone)]
pub struct Route {
    pub device: Arc<dyn NetDevice>,
    pub gateway: Option<Ipv4Addr>,
    // リダイレクト等で動的に書き換えられた経路かどうか
    pub modified: bool,
}

// ルーティングテーブルの抽象 (外部コラボレーター)
pub trait RouteLookup: Send + Sync {
    fn lookup(&self, dest: Ipv4Addr, local_only: bool) -> Option<Route>;
}

struct RouteEntry {
    network: Ipv4Network,
    gateway: Option<Ipv4Addr>,
    device: Arc<dyn NetDevice>,
    modified: bool,
}

// 静的ルーティングテーブル (最長プレフィックス一致)
pub struct StaticRouteTable {
    entries: Vec<RouteEntry>,
}

impl StaticRouteTable {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn add_route(
        &mut self,
        network: Ipv4Network,
        gateway: Option<Ipv4Addr>,
        device: Arc<dyn NetDevice>,
    ) {
        self.entries.push(RouteEntry {
            network,
            gateway,
            device,
            modified: false,
        });
    }

    // リダイレクトによって学習した経路として登録する
    pub fn add_modified_route(
        &mut self,
        network: Ipv4Network,
        gateway: Option<Ipv4Addr>,
        device: Arc<dyn NetDevice>,
    ) {
        self.entries.push(RouteEntry {
            network,
            gateway,
            device,
            modified: true,
        });
    }
}

impl RouteLookup for StaticRouteTable {
    fn lookup(&self, dest: Ipv4Addr, local_only: bool) -> Option<Route> {
        self.entries
            .iter()
            .filter(|entry| entry.network.contains(dest))
            .filter(|entry| !local_only || entry.gateway.is_none())
            .max_by_key(|entry| entry.network.prefix())
            .map(|entry| Route {
                device: Arc::clone(&entry.device),
                gateway: entry.gateway,
                modified: entry.modified,
            })
    }
}
