use parking_lot::Mutex;
use pulley_core::{LoadBalanceAlgorithm, LoadBalancerError, Result, Server};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// 服务器选择器
///
/// 持有各算法的游标状态。候选列表每次调用时重新传入，
/// 因此服务器的增删不会让游标越界
pub struct ServerSelector {
    round_robin_counter: AtomicUsize,
    /// 平滑加权轮询的 current weight，按服务器id保存
    current_weights: Mutex<HashMap<String, i64>>,
    rng: Mutex<StdRng>,
}

impl ServerSelector {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// 固定随机种子，测试中保证 Random 算法可复现
    pub fn with_rng_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            round_robin_counter: AtomicUsize::new(0),
            current_weights: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
        }
    }

    /// 按指定算法从候选列表中选择一个服务器
    pub fn select(
        &self,
        algorithm: LoadBalanceAlgorithm,
        candidates: &[Server],
        client_key: &str,
    ) -> Result<Server> {
        if candidates.is_empty() {
            return Err(LoadBalancerError::NoHealthyServers);
        }

        let selected = match algorithm {
            LoadBalanceAlgorithm::RoundRobin => self.select_round_robin(candidates),
            LoadBalanceAlgorithm::LeastConnections => self.select_least_connections(candidates),
            LoadBalanceAlgorithm::WeightedRoundRobin => {
                self.select_weighted_round_robin(candidates)
            }
            LoadBalanceAlgorithm::IpHash => self.select_ip_hash(candidates, client_key),
            LoadBalanceAlgorithm::Random => self.select_random(candidates),
        };

        debug!(
            "Selected server {} using {} from {} candidates",
            selected.id,
            algorithm,
            candidates.len()
        );

        Ok(selected)
    }

    /// 重置所有算法游标，切换算法时调用
    pub fn reset(&self) {
        self.round_robin_counter.store(0, Ordering::SeqCst);
        self.current_weights.lock().clear();
    }

    /// 服务器被移除时清理它的加权状态
    pub fn forget_server(&self, server_id: &str) {
        self.current_weights.lock().remove(server_id);
    }

    fn select_round_robin(&self, candidates: &[Server]) -> Server {
        let index = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[index].clone()
    }

    fn select_least_connections(&self, candidates: &[Server]) -> Server {
        // 相同连接数时取先出现的，保证结果确定
        let mut best = &candidates[0];
        for server in candidates.iter().skip(1) {
            if server.active_connections < best.active_connections {
                best = server;
            }
        }
        best.clone()
    }

    /// 平滑加权轮询（nginx 的 current weight 方案）
    ///
    /// 每轮每个候选的 current weight 加上自身权重，选出最大者后减去总权重。
    /// 一个周期（总权重次）内每个服务器恰好被选中 weight 次
    fn select_weighted_round_robin(&self, candidates: &[Server]) -> Server {
        let mut current_weights = self.current_weights.lock();
        let total_weight: i64 = candidates.iter().map(|s| i64::from(s.weight)).sum();

        let mut best_index = 0;
        let mut best_weight = i64::MIN;

        for (index, server) in candidates.iter().enumerate() {
            let current = current_weights.entry(server.id.clone()).or_insert(0);
            *current += i64::from(server.weight);

            if *current > best_weight {
                best_weight = *current;
                best_index = index;
            }
        }

        let selected = &candidates[best_index];
        if let Some(current) = current_weights.get_mut(&selected.id) {
            *current -= total_weight;
        }

        selected.clone()
    }

    /// 相同的 key 在相同的候选集合上总是映射到同一个服务器。
    /// 候选集合变化时映射会改变
    fn select_ip_hash(&self, candidates: &[Server], client_key: &str) -> Server {
        let index = (fnv1a_hash(client_key.as_bytes()) % candidates.len() as u64) as usize;
        candidates[index].clone()
    }

    fn select_random(&self, candidates: &[Server]) -> Server {
        let index = self.rng.lock().random_range(0..candidates.len());
        candidates[index].clone()
    }
}

impl Default for ServerSelector {
    fn default() -> Self {
        Self::new()
    }
}

/// FNV-1a 64位哈希，跨进程稳定
fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulley_core::HealthStatus;

    fn server(id: &str, weight: u32, active_connections: usize) -> Server {
        Server {
            id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            weight,
            max_connections: 100,
            active_connections,
            is_healthy: true,
            health: HealthStatus::Unknown,
            last_health_check_at: None,
            last_response_time_ms: None,
            metadata: HashMap::new(),
        }
    }

    fn create_test_servers() -> Vec<Server> {
        vec![server("a", 1, 0), server("b", 1, 0), server("c", 1, 0)]
    }

    fn count_selections(
        selector: &ServerSelector,
        algorithm: LoadBalanceAlgorithm,
        servers: &[Server],
        rounds: usize,
    ) -> HashMap<String, usize> {
        let mut selections = HashMap::new();
        for _ in 0..rounds {
            let selected = selector.select(algorithm, servers, "").unwrap();
            *selections.entry(selected.id).or_insert(0) += 1;
        }
        selections
    }

    #[test]
    fn test_empty_candidates() {
        let selector = ServerSelector::new();
        for algorithm in [
            LoadBalanceAlgorithm::RoundRobin,
            LoadBalanceAlgorithm::LeastConnections,
            LoadBalanceAlgorithm::WeightedRoundRobin,
            LoadBalanceAlgorithm::IpHash,
            LoadBalanceAlgorithm::Random,
        ] {
            assert!(matches!(
                selector.select(algorithm, &[], "client"),
                Err(LoadBalancerError::NoHealthyServers)
            ));
        }
    }

    #[test]
    fn test_round_robin_visits_each_server_once_in_order() {
        let selector = ServerSelector::new();
        let servers = create_test_servers();

        let ids: Vec<_> = (0..3)
            .map(|_| {
                selector
                    .select(LoadBalanceAlgorithm::RoundRobin, &servers, "")
                    .unwrap()
                    .id
            })
            .collect();

        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_survives_shrinking_candidates() {
        let selector = ServerSelector::new();
        let servers = create_test_servers();

        for _ in 0..5 {
            selector
                .select(LoadBalanceAlgorithm::RoundRobin, &servers, "")
                .unwrap();
        }

        let fewer = vec![server("a", 1, 0)];
        let selected = selector
            .select(LoadBalanceAlgorithm::RoundRobin, &fewer, "")
            .unwrap();
        assert_eq!(selected.id, "a");
    }

    #[test]
    fn test_reset_restarts_round_robin() {
        let selector = ServerSelector::new();
        let servers = create_test_servers();

        selector
            .select(LoadBalanceAlgorithm::RoundRobin, &servers, "")
            .unwrap();
        selector.reset();

        let selected = selector
            .select(LoadBalanceAlgorithm::RoundRobin, &servers, "")
            .unwrap();
        assert_eq!(selected.id, "a");
    }

    #[test]
    fn test_least_connections_prefers_idle_server() {
        let selector = ServerSelector::new();
        let servers = vec![server("a", 1, 5), server("b", 1, 2), server("c", 1, 7)];

        let selected = selector
            .select(LoadBalanceAlgorithm::LeastConnections, &servers, "")
            .unwrap();
        assert_eq!(selected.id, "b");
    }

    #[test]
    fn test_least_connections_breaks_ties_by_order() {
        let selector = ServerSelector::new();
        let servers = vec![server("a", 1, 1), server("b", 1, 0), server("c", 1, 0)];

        for _ in 0..3 {
            let selected = selector
                .select(LoadBalanceAlgorithm::LeastConnections, &servers, "")
                .unwrap();
            assert_eq!(selected.id, "b");
        }
    }

    #[test]
    fn test_weighted_round_robin_distribution_matches_weights() {
        let selector = ServerSelector::new();
        let servers = vec![server("a", 5, 0), server("b", 1, 0), server("c", 1, 0)];

        let selections = count_selections(
            &selector,
            LoadBalanceAlgorithm::WeightedRoundRobin,
            &servers,
            7,
        );

        assert_eq!(selections["a"], 5);
        assert_eq!(selections["b"], 1);
        assert_eq!(selections["c"], 1);
    }

    #[test]
    fn test_weighted_round_robin_is_smooth() {
        let selector = ServerSelector::new();
        let servers = vec![server("a", 1, 0), server("b", 3, 0)];

        let ids: Vec<_> = (0..4)
            .map(|_| {
                selector
                    .select(LoadBalanceAlgorithm::WeightedRoundRobin, &servers, "")
                    .unwrap()
                    .id
            })
            .collect();

        assert_eq!(ids, vec!["b", "a", "b", "b"]);

        // 下一个周期顺序相同
        let next_cycle: Vec<_> = (0..4)
            .map(|_| {
                selector
                    .select(LoadBalanceAlgorithm::WeightedRoundRobin, &servers, "")
                    .unwrap()
                    .id
            })
            .collect();
        assert_eq!(ids, next_cycle);
    }

    #[test]
    fn test_ip_hash_is_stable() {
        let selector = ServerSelector::new();
        let servers = create_test_servers();

        let first = selector
            .select(LoadBalanceAlgorithm::IpHash, &servers, "192.168.1.20")
            .unwrap();
        for _ in 0..20 {
            let again = selector
                .select(LoadBalanceAlgorithm::IpHash, &servers, "192.168.1.20")
                .unwrap();
            assert_eq!(first.id, again.id);
        }
    }

    #[test]
    fn test_ip_hash_spreads_keys() {
        let selector = ServerSelector::new();
        let servers = create_test_servers();

        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            let key = format!("10.0.0.{}", i);
            let selected = selector
                .select(LoadBalanceAlgorithm::IpHash, &servers, &key)
                .unwrap();
            seen.insert(selected.id);
        }

        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a_hash(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_random_is_reproducible_with_seed() {
        let servers = create_test_servers();
        let first = ServerSelector::with_rng_seed(42);
        let second = ServerSelector::with_rng_seed(42);

        for _ in 0..20 {
            let a = first
                .select(LoadBalanceAlgorithm::Random, &servers, "")
                .unwrap();
            let b = second
                .select(LoadBalanceAlgorithm::Random, &servers, "")
                .unwrap();
            assert_eq!(a.id, b.id);
        }
    }

    #[test]
    fn test_random_reaches_every_server() {
        let selector = ServerSelector::with_rng_seed(7);
        let servers = create_test_servers();

        let selections =
            count_selections(&selector, LoadBalanceAlgorithm::Random, &servers, 300);

        assert_eq!(selections.len(), 3);
    }
}
