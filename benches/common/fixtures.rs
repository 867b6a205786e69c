use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Test data structure for benchmarks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchUser {
    pub id: u64,
    pub name: String,
    pub email: String,
    pub score: u32,
}

impl BenchUser {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            name: format!("User {}", id),
            email: format!("user{}@example.com", id),
            score: (id % 1000) as u32,
        }
    }
}

/// Simulated database with configurable latency
#[derive(Clone)]
pub struct FakeDatabase {
    data: Arc<HashMap<String, BenchUser>>,
    latency_ms: u64,
    query_count: Arc<AtomicUsize>,
}

impl FakeDatabase {
    pub fn new(num_users: usize, latency_ms: u64) -> Self {
        let mut data = HashMap::new();
        for i in 0..num_users {
            data.insert(format!("user:{}", i), BenchUser::new(i as u64));
        }

        Self {
            data: Arc::new(data),
            latency_ms,
            query_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn get_many(&self, keys: &[String]) -> Vec<Option<BenchUser>> {
        self.query_count.fetch_add(1, Ordering::Relaxed);

        // Simulate database latency
        tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;

        keys.iter().map(|k| self.data.get(k).cloned()).collect()
    }

    #[allow(dead_code)]
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::Relaxed)
    }
}

/// Deterministic key sequences for benchmark loops
pub struct KeyGenerator {
    num_keys: usize,
}

impl KeyGenerator {
    pub fn new(num_keys: usize) -> Self {
        Self { num_keys }
    }

    pub fn sequential(&self) -> Vec<String> {
        (0..self.num_keys).map(|i| format!("user:{}", i)).collect()
    }
}
