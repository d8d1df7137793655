//! Concurrent image availability checks.
//!
//! A bounded pool of scoped worker threads pulls images off a shared index and
//! sends results over a channel. The coordinator waits at most `join_timeout`
//! for each result; anything still outstanding is classified as a timeout.

use crate::CoreError;
use serde::Serialize;
use stackup_runtime::{ImageQuery, ImageRef, StackRuntime};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Ok,
    RateLimited,
    AccessDenied,
    Timeout,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageCheckResult {
    pub image: String,
    pub available: bool,
    pub error_detail: Option<String>,
    pub classification: Classification,
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub workers: usize,
    pub probe_timeout: Duration,
    pub join_timeout: Duration,
    pub continue_on_error: bool,
    pub check_updates: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub results: Vec<ImageCheckResult>,
    /// Newer major versions found by the update advisory.
    pub updates: Vec<String>,
    pub warnings: Vec<String>,
}

impl ProbeReport {
    pub fn available(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter(|r| r.available)
            .map(|r| r.image.as_str())
    }

    pub fn missing(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.available)
            .map(|r| r.image.clone())
            .collect()
    }

    /// Image to diagnostic text, for images whose probe reported one.
    pub fn diagnostics(&self) -> BTreeMap<String, String> {
        self.results
            .iter()
            .filter_map(|r| r.error_detail.as_ref().map(|d| (r.image.clone(), d.clone())))
            .collect()
    }

    pub fn into_result(self) -> Result<Self, CoreError> {
        let missing = self.missing();
        if missing.is_empty() {
            Ok(self)
        } else {
            Err(CoreError::ImageAvailability { missing })
        }
    }
}

pub fn classify(detail: &str) -> Classification {
    let d = detail.to_ascii_lowercase();
    if d.contains("toomanyrequests") || d.contains("rate limit") {
        Classification::RateLimited
    } else if d.contains("denied") || d.contains("unauthorized") {
        Classification::AccessDenied
    } else {
        Classification::Unknown
    }
}

/// Turn a raw query outcome into a result, applying the availability policy.
/// Returns a warning when the image passes despite a failed query.
pub fn judge(
    image: &str,
    query: ImageQuery,
    continue_on_error: bool,
) -> (ImageCheckResult, Option<String>) {
    let (classification, detail) = match query {
        ImageQuery::Found => (Classification::Ok, None),
        ImageQuery::TimedOut => (Classification::Timeout, Some("probe timed out".to_owned())),
        ImageQuery::Failed { detail } => (classify(&detail), Some(detail)),
    };

    let (available, warning) = match classification {
        Classification::Ok => (true, None),
        Classification::RateLimited => (
            true,
            Some(format!("{image}: registry rate limit hit; assuming available")),
        ),
        Classification::AccessDenied if ImageRef::parse(image).is_local_namespace() => {
            if continue_on_error {
                (
                    true,
                    Some(format!(
                        "{image}: access denied for local image; continuing as requested"
                    )),
                )
            } else {
                (false, None)
            }
        }
        Classification::AccessDenied | Classification::Timeout | Classification::Unknown => {
            (false, None)
        }
    };

    (
        ImageCheckResult {
            image: image.to_owned(),
            available,
            error_detail: detail,
            classification,
        },
        warning,
    )
}

/// Query every image on a bounded worker pool. `None` marks images with no
/// answer before the join timeout.
fn run_pool(
    runtime: &dyn StackRuntime,
    images: &[String],
    opts: &ProbeOptions,
) -> Vec<Option<ImageQuery>> {
    let mut results: Vec<Option<ImageQuery>> = vec![None; images.len()];
    if images.is_empty() {
        return results;
    }
    let workers = opts.workers.clamp(1, images.len());
    let next = AtomicUsize::new(0);
    let cancel = AtomicBool::new(false);
    let (tx, rx) = mpsc::channel::<(usize, ImageQuery)>();

    thread::scope(|s| {
        for _ in 0..workers {
            let tx = tx.clone();
            let (next, cancel) = (&next, &cancel);
            s.spawn(move || loop {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(image) = images.get(i) else {
                    break;
                };
                debug!("probing {image}");
                let q = runtime.query_image(image, opts.probe_timeout);
                if tx.send((i, q)).is_err() {
                    break;
                }
            });
        }
        drop(tx);

        for _ in 0..images.len() {
            match rx.recv_timeout(opts.join_timeout) {
                Ok((i, q)) => results[i] = Some(q),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "no probe result within {}s; abandoning remaining images",
                        opts.join_timeout.as_secs()
                    );
                    cancel.store(true, Ordering::Relaxed);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        // Queries are bounded by probe_timeout, so the scope join is too.
        cancel.store(true, Ordering::Relaxed);
    });

    results
}

pub fn probe_images(
    runtime: &dyn StackRuntime,
    images: &[String],
    opts: &ProbeOptions,
) -> ProbeReport {
    info!("probing {} images with up to {} workers", images.len(), opts.workers);
    let mut report = ProbeReport::default();

    for (image, query) in images.iter().zip(run_pool(runtime, images, opts)) {
        let query = query.unwrap_or(ImageQuery::TimedOut);
        let (result, warning) = judge(image, query, opts.continue_on_error);
        if let Some(w) = warning {
            warn!("{w}");
            report.warnings.push(w);
        }
        if !result.available {
            debug!(
                "{image} missing ({:?}): {}",
                result.classification,
                result.error_detail.as_deref().unwrap_or("")
            );
        }
        report.results.push(result);
    }

    if opts.check_updates {
        check_updates(runtime, opts, &mut report);
    }
    report
}

/// For each image, report the first of the next two major tags that exists.
fn check_updates(runtime: &dyn StackRuntime, opts: &ProbeOptions, report: &mut ProbeReport) {
    let per_image: Vec<Vec<String>> = report
        .results
        .iter()
        .filter(|r| r.classification == Classification::Ok)
        .map(|r| ImageRef::parse(&r.image).next_major_refs(2))
        .filter(|c| !c.is_empty())
        .collect();
    if per_image.is_empty() {
        return;
    }

    let candidates: Vec<String> = per_image.iter().flatten().cloned().collect();
    let found: Vec<&str> = candidates
        .iter()
        .zip(run_pool(runtime, &candidates, opts))
        .filter(|(_, q)| *q == Some(ImageQuery::Found))
        .map(|(c, _)| c.as_str())
        .collect();

    for refs in &per_image {
        let Some(candidate) = refs.iter().find(|c| found.contains(&c.as_str())) else {
            continue;
        };
        let msg = format!("newer major version available: {candidate}");
        warn!("{msg}");
        report.updates.push(candidate.clone());
        report.warnings.push(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackup_runtime::mock::MockBackend;

    fn opts() -> ProbeOptions {
        ProbeOptions {
            workers: 4,
            probe_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(5),
            continue_on_error: false,
            check_updates: false,
        }
    }

    fn failed(detail: &str) -> ImageQuery {
        ImageQuery::Failed {
            detail: detail.to_owned(),
        }
    }

    #[test]
    fn classification_signatures() {
        assert_eq!(classify("toomanyrequests: slow down"), Classification::RateLimited);
        assert_eq!(classify("You have reached your pull Rate Limit"), Classification::RateLimited);
        assert_eq!(classify("denied: requested access to the resource is denied"), Classification::AccessDenied);
        assert_eq!(classify("401 Unauthorized"), Classification::AccessDenied);
        assert_eq!(classify("no such manifest"), Classification::Unknown);
    }

    #[test]
    fn rate_limited_is_never_missing() {
        let (r, w) = judge("postgres:16", failed("toomanyrequests"), false);
        assert!(r.available);
        assert_eq!(r.classification, Classification::RateLimited);
        assert!(w.is_some());
    }

    #[test]
    fn local_access_denied_respects_continue_flag() {
        let (r, _) = judge("myapp:local", failed("unauthorized"), false);
        assert!(!r.available);
        let (r, w) = judge("localhost:5000/myapp:1", failed("denied"), true);
        assert!(r.available);
        assert!(w.is_some());
        let (r, _) = judge("ghcr.io/org/private:1", failed("denied"), true);
        assert!(!r.available, "continue flag covers local images only");
    }

    #[test]
    fn registry_less_image_counts_as_local() {
        let denied = "denied: requested access to the resource is denied";
        let (r, w) = judge("myapp:1.0", failed(denied), true);
        assert!(r.available);
        assert_eq!(r.classification, Classification::AccessDenied);
        assert!(w.unwrap().contains("myapp:1.0"));

        let (r, w) = judge("myapp:1.0", failed(denied), false);
        assert!(!r.available);
        assert!(w.is_none());
    }

    #[test]
    fn pool_reports_every_image() {
        let images: Vec<String> = (0..10).map(|i| format!("img{i}:1")).collect();
        let mock = MockBackend::new()
            .with_image_result("img3:1", failed("toomanyrequests"))
            .with_image_result("img7:1", failed("manifest unknown"));
        let report = probe_images(&mock, &images, &ProbeOptions { workers: 3, ..opts() });

        assert_eq!(report.results.len(), 10);
        assert_eq!(report.missing(), vec!["img7:1"]);
        assert_eq!(report.diagnostics().len(), 2);
        let err = report.into_result().unwrap_err();
        assert!(matches!(err, CoreError::ImageAvailability { ref missing } if missing == &["img7:1".to_owned()]));
    }

    #[test]
    fn join_timeout_marks_outstanding_images() {
        let images = vec!["slow:1".to_owned()];
        let mock = MockBackend::new().with_image_delay(Duration::from_millis(300));
        let report = probe_images(
            &mock,
            &images,
            &ProbeOptions {
                join_timeout: Duration::from_millis(50),
                ..opts()
            },
        );
        assert_eq!(report.results[0].classification, Classification::Timeout);
        assert!(!report.results[0].available);
    }

    #[test]
    fn update_advisory() {
        let images = vec!["postgres:16".to_owned(), "redis:latest".to_owned()];
        let mock = MockBackend::new().with_image_result("postgres:18", failed("manifest unknown"));
        let report = probe_images(&mock, &images, &ProbeOptions { check_updates: true, ..opts() });
        assert_eq!(report.updates, vec!["postgres:17"]);
        assert!(report.missing().is_empty());
    }

    #[test]
    fn update_advisory_stops_at_first_major() {
        let images = vec!["postgres:16".to_owned()];
        let report = probe_images(
            &MockBackend::new(),
            &images,
            &ProbeOptions { check_updates: true, ..opts() },
        );
        assert_eq!(report.updates, vec!["postgres:17"]);
        assert_eq!(report.warnings.len(), 1);
    }
}
