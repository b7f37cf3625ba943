use std::collections::{BTreeSet, HashMap, HashSet};

use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Sightings below or at this count are treated as noise.
const MIN_SIGHTINGS_EXCLUSIVE: usize = 2;

/// Raw IP sightings for one user in the current window. Duplicates are kept.
#[derive(Debug)]
struct ActiveUser {
    name: String,
    ips: Vec<String>,
}

#[derive(Debug, Default)]
struct Sightings {
    users: Vec<ActiveUser>,
    index: HashMap<String, usize>,
}

/// Per-user set of IPs seen often enough in one window to count.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct UsageReport {
    pub(crate) name: String,
    pub(crate) ips: BTreeSet<String>,
}

/// Accumulates `(username, ip)` sightings between detection cycles.
///
/// `record` and `drain` share one lock, so a sighting recorded while a drain
/// is running lands either in the drained report or in the next window.
#[derive(Debug, Default)]
pub(crate) struct ObservationWindow {
    sightings: Mutex<Sightings>,
}

impl ObservationWindow {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn record(&self, username: &str, ip: &str) {
        if username.is_empty() || ip.is_empty() {
            return;
        }

        let mut sightings = self.sightings.lock().await;
        let Sightings { users, index } = &mut *sightings;

        let position = *index.entry(username.to_owned()).or_insert_with(|| {
            users.push(ActiveUser {
                name: username.to_owned(),
                ips: Vec::new(),
            });
            users.len() - 1
        });

        users[position].ips.push(ip.to_owned());
    }

    /// Build this window's usage reports and reset the window.
    ///
    /// Users missing from `known_users` (when given) are skipped. Reports are
    /// ordered by descending IP count; ties keep first-seen order.
    #[instrument(skip_all)]
    pub(crate) async fn drain(&self, known_users: Option<&HashSet<String>>) -> Vec<UsageReport> {
        let mut sightings = self.sightings.lock().await;

        let mut reports = Vec::new();
        for user in &sightings.users {
            if let Some(known_users) = known_users
                && !known_users.contains(&user.name)
            {
                debug!(user = %user.name, "Skipping user unknown to the panel");
                continue;
            }

            let mut counts: HashMap<&str, usize> = HashMap::new();
            for ip in &user.ips {
                *counts.entry(ip.as_str()).or_default() += 1;
            }

            let ips = counts
                .into_iter()
                .filter(|&(_, count)| count > MIN_SIGHTINGS_EXCLUSIVE)
                .map(|(ip, _)| ip.to_owned())
                .collect::<BTreeSet<_>>();

            if ips.is_empty() {
                continue;
            }

            reports.push(UsageReport {
                name: user.name.clone(),
                ips,
            });
        }

        reports.sort_by(|a, b| b.ips.len().cmp(&a.ips.len()));

        *sightings = Sightings::default();

        reports
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    async fn record_times(window: &ObservationWindow, user: &str, ip: &str, times: usize) {
        for _ in 0..times {
            window.record(user, ip).await;
        }
    }

    #[tokio::test]
    async fn only_ips_seen_more_than_twice_are_reported() {
        let window = ObservationWindow::new();
        record_times(&window, "alice", "10.0.0.1", 1).await;
        record_times(&window, "alice", "10.0.0.2", 2).await;
        record_times(&window, "alice", "10.0.0.3", 3).await;
        record_times(&window, "alice", "10.0.0.4", 7).await;

        let reports = window.drain(None).await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "alice");
        assert_eq!(
            reports[0].ips.iter().map(String::as_str).collect::<Vec<_>>(),
            ["10.0.0.3", "10.0.0.4"]
        );
    }

    #[tokio::test]
    async fn user_with_only_noise_has_no_report() {
        let window = ObservationWindow::new();
        record_times(&window, "bob", "10.0.0.1", 2).await;
        record_times(&window, "bob", "10.0.0.2", 1).await;

        assert!(window.drain(None).await.is_empty());
    }

    #[tokio::test]
    async fn second_drain_is_empty() {
        let window = ObservationWindow::new();
        record_times(&window, "alice", "10.0.0.1", 5).await;

        assert_eq!(window.drain(None).await.len(), 1);
        assert!(window.drain(None).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_users_are_skipped_and_cleared() {
        let window = ObservationWindow::new();
        record_times(&window, "alice", "10.0.0.1", 3).await;
        record_times(&window, "removed", "10.0.0.9", 3).await;

        let known = HashSet::from(["alice".to_owned()]);
        let reports = window.drain(Some(&known)).await;

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "alice");
        assert!(window.drain(None).await.is_empty());
    }

    #[tokio::test]
    async fn reports_sorted_by_ip_count_then_first_seen() {
        let window = ObservationWindow::new();
        record_times(&window, "one", "1.1.1.1", 3).await;
        record_times(&window, "two-a", "2.2.2.1", 3).await;
        record_times(&window, "two-a", "2.2.2.2", 3).await;
        record_times(&window, "two-b", "3.3.3.1", 3).await;
        record_times(&window, "two-b", "3.3.3.2", 3).await;
        record_times(&window, "three", "4.4.4.1", 3).await;
        record_times(&window, "three", "4.4.4.2", 3).await;
        record_times(&window, "three", "4.4.4.3", 3).await;

        let names = window
            .drain(None)
            .await
            .into_iter()
            .map(|report| report.name)
            .collect::<Vec<_>>();

        assert_eq!(names, ["three", "two-a", "two-b", "one"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sightings_recorded_during_drain_are_not_lost() {
        const ADDRESSES: usize = 500;

        let window = Arc::new(ObservationWindow::new());
        let producer = tokio::spawn({
            let window = Arc::clone(&window);
            async move {
                for i in 0..ADDRESSES {
                    let ip = format!("10.0.{}.{}", i / 256, i % 256);
                    for _ in 0..3 {
                        window.record("alice", &ip).await;
                    }
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        let first = window.drain(None).await;
        producer.await.unwrap();
        let second = window.drain(None).await;

        let ips = |reports: Vec<UsageReport>| {
            reports
                .into_iter()
                .flat_map(|report| report.ips)
                .collect::<BTreeSet<_>>()
        };
        let (first, second) = (ips(first), ips(second));

        assert!(first.is_disjoint(&second));
        // Only the address being recorded when the drain ran can have its
        // sightings split across the two windows.
        assert!(first.len() + second.len() >= ADDRESSES - 1);
    }

    #[tokio::test]
    async fn empty_fields_are_ignored() {
        let window = ObservationWindow::new();
        record_times(&window, "", "1.1.1.1", 3).await;
        record_times(&window, "alice", "", 3).await;

        assert!(window.drain(None).await.is_empty());
    }
}
