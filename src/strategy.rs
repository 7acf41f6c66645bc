//! Iteration over connect candidates across descriptions and retry rounds
//!
//! The strategy owns the navigated descriptions and hands out one candidate
//! per call. The cursor survives across calls, so after a failed attempt the
//! caller simply asks again and resumes exactly where it left off. Every
//! `description x option x (1 + retry_count)` combination is offered once
//! before the strategy reports exhaustion.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::down_hosts::DownHostsCache;
use crate::error::{Error, Result};
use crate::navigator::{ConnectOption, ConnectionDescription, DescriptionParams};

const DEFAULT_RETRY_COUNT: u32 = 0;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One candidate to try, with the parameters of the description it came from
#[derive(Debug, Clone)]
pub struct Candidate {
    pub option: ConnectOption,
    pub params: DescriptionParams,
}

pub struct ConnectionStrategy {
    descriptions: Vec<ConnectionDescription>,
    cache: Arc<DownHostsCache>,
    /// retry schedule from user configuration, overridden per description
    user_retry_count: Option<u32>,
    user_retry_delay: Option<Duration>,
    desc_idx: usize,
    attempt: u32,
    opt_idx: usize,
}

impl ConnectionStrategy {
    pub fn new(
        descriptions: Vec<ConnectionDescription>,
        cache: Arc<DownHostsCache>,
        user_retry_count: Option<u32>,
        user_retry_delay: Option<Duration>,
    ) -> Self {
        Self {
            descriptions,
            cache,
            user_retry_count,
            user_retry_delay,
            desc_idx: 0,
            attempt: 0,
            opt_idx: 0,
        }
    }

    /// Total candidates this strategy can yield before exhaustion
    pub fn remaining_upper_bound(&self) -> usize {
        self.descriptions
            .iter()
            .map(|d| d.options.len() * (1 + self.retry_count_for(d) as usize))
            .sum()
    }

    fn retry_count_for(&self, desc: &ConnectionDescription) -> u32 {
        desc.retry_count
            .or(self.user_retry_count)
            .unwrap_or(DEFAULT_RETRY_COUNT)
    }

    fn retry_delay_for(&self, desc: &ConnectionDescription) -> Duration {
        desc.retry_delay
            .or(self.user_retry_delay)
            .unwrap_or(DEFAULT_RETRY_DELAY)
    }

    /// Next candidate, sleeping the retry delay when moving between rounds
    /// of the same description
    pub async fn next(&mut self) -> Result<Candidate> {
        while self.desc_idx < self.descriptions.len() {
            let retry_count = self.retry_count_for(&self.descriptions[self.desc_idx]);
            let retry_delay = self.retry_delay_for(&self.descriptions[self.desc_idx]);

            while self.attempt <= retry_count {
                if self.opt_idx == 0 {
                    // every round starts with known-down hosts demoted,
                    // including the first
                    let desc = &mut self.descriptions[self.desc_idx];
                    self.cache.reorder(&mut desc.options, |o| o.hostname.as_str());
                }
                let desc = &self.descriptions[self.desc_idx];
                if self.opt_idx < desc.options.len() {
                    let candidate = Candidate {
                        option: desc.options[self.opt_idx].clone(),
                        params: desc.params.clone(),
                    };
                    debug!(
                        description = self.desc_idx,
                        attempt = self.attempt,
                        option = self.opt_idx,
                        host = %candidate.option.hostname,
                        port = candidate.option.port,
                        "yielding connect candidate"
                    );
                    self.opt_idx += 1;
                    return Ok(candidate);
                }
                self.opt_idx = 0;
                self.attempt += 1;
                if self.attempt <= retry_count {
                    debug!(
                        description = self.desc_idx,
                        attempt = self.attempt,
                        delay_ms = retry_delay.as_millis() as u64,
                        "sleeping before retry round"
                    );
                    tokio::time::sleep(retry_delay).await;
                }
            }
            self.desc_idx += 1;
            self.attempt = 0;
            self.opt_idx = 0;
        }
        Err(Error::OptionsExhausted)
    }

    pub fn mark_down(&self, host: &str) {
        self.cache.mark_down(host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor;
    use crate::navigator;
    use rand::SeedableRng;
    use rand_pcg::Pcg32;

    async fn descriptions(text: &str) -> Vec<ConnectionDescription> {
        let root = descriptor::parse(text).unwrap();
        let mut rng = Pcg32::seed_from_u64(3);
        navigator::navigate(&root, &mut rng).await.unwrap()
    }

    fn strategy(descs: Vec<ConnectionDescription>) -> ConnectionStrategy {
        ConnectionStrategy::new(descs, Arc::new(DownHostsCache::default()), None, None)
    }

    #[tokio::test(start_paused = true)]
    async fn yields_each_option_once_per_round() {
        let descs = descriptions(
            "(DESCRIPTION=(RETRY_COUNT=1)(RETRY_DELAY=1)(ADDRESS=(HOST=10.0.0.1)(PORT=1521))(ADDRESS=(HOST=10.0.0.2)(PORT=1521))(CONNECT_DATA=(SERVICE_NAME=svc)))",
        )
        .await;
        let mut strategy = strategy(descs);
        let mut hosts = Vec::new();
        for _ in 0..4 {
            hosts.push(strategy.next().await.unwrap().option.hostname);
        }
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.1", "10.0.0.2"]);
        assert!(matches!(strategy.next().await, Err(Error::OptionsExhausted)));
    }

    #[tokio::test]
    async fn exhausts_after_every_combination() {
        let descs = descriptions(
            "(DESCRIPTION_LIST=(LOAD_BALANCE=off)(DESCRIPTION=(RETRY_COUNT=0)(ADDRESS=(HOST=10.0.0.1)(PORT=1521))(CONNECT_DATA=(SERVICE_NAME=a)))(DESCRIPTION=(RETRY_COUNT=0)(ADDRESS=(HOST=10.0.0.2)(PORT=1521))(ADDRESS=(HOST=10.0.0.3)(PORT=1521))(CONNECT_DATA=(SERVICE_NAME=b))))",
        )
        .await;
        let mut strategy = strategy(descs);
        assert_eq!(strategy.remaining_upper_bound(), 3);
        for _ in 0..3 {
            strategy.next().await.unwrap();
        }
        assert!(matches!(strategy.next().await, Err(Error::OptionsExhausted)));
    }

    #[tokio::test]
    async fn down_host_demoted_on_first_round() {
        let descs = descriptions(
            "(DESCRIPTION=(ADDRESS=(HOST=10.0.0.1)(PORT=1521))(ADDRESS=(HOST=10.0.0.2)(PORT=1521))(CONNECT_DATA=(SERVICE_NAME=svc)))",
        )
        .await;
        let cache = Arc::new(DownHostsCache::default());
        cache.mark_down("10.0.0.1");
        let mut strategy = ConnectionStrategy::new(descs, cache, None, None);
        assert_eq!(strategy.next().await.unwrap().option.hostname, "10.0.0.2");
        assert_eq!(strategy.next().await.unwrap().option.hostname, "10.0.0.1");
    }

    #[tokio::test(start_paused = true)]
    async fn host_marked_down_mid_round_reorders_next_round() {
        let descs = descriptions(
            "(DESCRIPTION=(RETRY_COUNT=1)(RETRY_DELAY=1)(ADDRESS=(HOST=10.0.0.1)(PORT=1521))(ADDRESS=(HOST=10.0.0.2)(PORT=1521))(CONNECT_DATA=(SERVICE_NAME=svc)))",
        )
        .await;
        let mut strategy = strategy(descs);
        assert_eq!(strategy.next().await.unwrap().option.hostname, "10.0.0.1");
        strategy.mark_down("10.0.0.1");
        // current round continues in place
        assert_eq!(strategy.next().await.unwrap().option.hostname, "10.0.0.2");
        // next round is reordered
        assert_eq!(strategy.next().await.unwrap().option.hostname, "10.0.0.2");
        assert_eq!(strategy.next().await.unwrap().option.hostname, "10.0.0.1");
    }

    #[tokio::test]
    async fn user_retry_settings_apply_when_description_has_none() {
        let descs = descriptions(
            "(DESCRIPTION=(ADDRESS=(HOST=10.0.0.1)(PORT=1521))(CONNECT_DATA=(SERVICE_NAME=svc)))",
        )
        .await;
        let mut strategy = ConnectionStrategy::new(
            descs,
            Arc::new(DownHostsCache::default()),
            Some(2),
            Some(Duration::from_millis(1)),
        );
        let mut yielded = 0;
        while strategy.next().await.is_ok() {
            yielded += 1;
        }
        assert_eq!(yielded, 3);
    }
}
