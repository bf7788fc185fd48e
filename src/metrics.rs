//! Controller metrics.
//!
//! Components receive a [`Metrics`] value instead of writing to the global
//! `metrics` recorder, so tests can observe counters through a private
//! recorder and the server can render its own Prometheus registry.

use std::sync::Arc;

use metrics::{Key, Label, Level, Metadata, NoopRecorder, Recorder};

const MSG_RECV: &str = "kobold_recv_total";
const RUN_ACTIVE: &str = "kobold_run_active";
const RUN_STATUS: &str = "kobold_run_total";
const GIT_FETCH: &str = "kobold_git_fetch_total";
const GIT_PUSH: &str = "kobold_git_push_total";
const IMAGE_SEEN: &str = "kobold_image_seen_total";
const DISPATCH: &str = "kobold_dispatch_total";

static METADATA: Metadata<'static> =
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

/// Handle to the recorder all controller metrics go to.
#[derive(Clone)]
pub struct Metrics {
    recorder: Arc<dyn Recorder + Send + Sync>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::noop()
    }
}

impl Metrics {
    pub fn new(recorder: Arc<dyn Recorder + Send + Sync>) -> Self {
        Metrics { recorder }
    }

    /// Discards everything.
    pub fn noop() -> Self {
        Metrics::new(Arc::new(NoopRecorder))
    }

    /// An event arrived on `channel`. `rejected` is true when it could not be
    /// decoded or queued.
    pub fn message_received(&self, channel: &str, rejected: bool) {
        self.count(
            MSG_RECV,
            vec![
                Label::new("channel", channel.to_string()),
                Label::new("rejected", rejected.to_string()),
            ],
        );
    }

    pub fn run_started(&self, repo: &str) {
        self.recorder
            .register_gauge(&key(RUN_ACTIVE, vec![Label::new("repo", repo.to_string())]), &METADATA)
            .increment(1.0);
    }

    pub fn run_finished(&self, repo: &str) {
        self.recorder
            .register_gauge(&key(RUN_ACTIVE, vec![Label::new("repo", repo.to_string())]), &METADATA)
            .decrement(1.0);
    }

    /// A task group reached a terminal status.
    pub fn run_outcome(&self, status: &str, repo: &str) {
        self.count(
            RUN_STATUS,
            vec![
                Label::new("status", status.to_string()),
                Label::new("repo", repo.to_string()),
            ],
        );
    }

    pub fn git_fetch(&self, repo: &str) {
        self.count(GIT_FETCH, vec![Label::new("repo", repo.to_string())]);
    }

    pub fn git_push(&self, repo: &str) {
        self.count(GIT_PUSH, vec![Label::new("repo", repo.to_string())]);
    }

    pub fn image_seen(&self, image: &str) {
        self.count(IMAGE_SEEN, vec![Label::new("ref", image.to_string())]);
    }

    pub fn dispatch_cycle(&self) {
        self.count(DISPATCH, vec![]);
    }

    fn count(&self, name: &'static str, labels: Vec<Label>) {
        self.recorder
            .register_counter(&key(name, labels), &METADATA)
            .increment(1);
    }
}

fn key(name: &'static str, labels: Vec<Label>) -> Key {
    Key::from_parts(name, labels)
}
