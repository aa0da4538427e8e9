use std::sync::atomic::{AtomicUsize, Ordering};

use stratus_backend::ReplicaInfo;

/// A healthy replica offered to the routing strategy.
pub struct Candidate<'a> {
    pub replica: &'a ReplicaInfo,
    /// Requests routed to this replica and not yet finished.
    pub outstanding: u64,
}

/// Pluggable target selection. The balancer has already filtered the
/// candidates down to healthy replicas with a closed circuit.
pub trait RoutingStrategy: Send + Sync {
    /// Index into `candidates`.
    fn select(&self, candidates: &[Candidate]) -> Option<usize>;

    fn name(&self) -> &'static str;
}

/// Cycle through candidates in order.
#[derive(Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoutingStrategy for RoundRobin {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(self.next.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Fewest outstanding requests; ties go to the earlier candidate.
pub struct LeastOutstanding;

impl RoutingStrategy for LeastOutstanding {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(i, c)| (c.outstanding, *i))
            .map(|(i, _)| i)
    }

    fn name(&self) -> &'static str {
        "least_outstanding"
    }
}

pub fn parse_strategy(name: &str) -> Result<Box<dyn RoutingStrategy>, String> {
    match name {
        "round_robin" => Ok(Box::new(RoundRobin::default())),
        "least_outstanding" => Ok(Box::new(LeastOutstanding)),
        other => Err(format!(
            "unknown routing strategy '{}', available: round_robin, least_outstanding",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use stratus_backend::ReplicaStatus;
    use stratus_common::WorkloadRef;

    fn replica(id: u64) -> ReplicaInfo {
        ReplicaInfo {
            service: "web".to_string(),
            replica_id: id,
            workload: WorkloadRef {
                family: "web".to_string(),
                revision: 1,
            },
            zone: "zone-a".to_string(),
            address: SocketAddr::from(([10, 1, 3, 4], 5000)),
            status: ReplicaStatus::Healthy,
            last_heartbeat_ms: 0,
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let (r0, r1) = (replica(0), replica(1));
        let candidates = vec![
            Candidate { replica: &r0, outstanding: 0 },
            Candidate { replica: &r1, outstanding: 0 },
        ];
        let rr = RoundRobin::default();
        let picks: Vec<_> = (0..4).filter_map(|_| rr.select(&candidates)).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
        assert_eq!(rr.select(&[]), None);
    }

    #[test]
    fn test_least_outstanding() {
        let (r0, r1, r2) = (replica(0), replica(1), replica(2));
        let candidates = vec![
            Candidate { replica: &r0, outstanding: 4 },
            Candidate { replica: &r1, outstanding: 1 },
            Candidate { replica: &r2, outstanding: 1 },
        ];
        assert_eq!(LeastOutstanding.select(&candidates), Some(1));
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!(parse_strategy("least_outstanding").unwrap().name(), "least_outstanding");
        assert!(parse_strategy("random").is_err());
    }
}
