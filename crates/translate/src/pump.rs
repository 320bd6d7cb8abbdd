// crates/translate/src/pump.rs
//! Asynchronous translation pump.
//!
//! A bounded, two-priority job queue with batching, deduplication, in-flight
//! coalescing, and backpressure. Ingestion enqueues and returns immediately;
//! one dedicated worker task performs the slow translator round-trips and
//! reports every completion through a single callback.
//!
//! Queue discipline: the worker drains its local overflow buffer first, then
//! the high queue (short poll), then the low queue (longer poll). High holds
//! realtime jobs and forced retranslations; low holds batchable replay and
//! import jobs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::batch::{looks_untranslated, pack_batch, preserves_markdown, unpack_batch};
use crate::translator::{TranslateError, Translator};

/// Tuning knobs for the pump. Defaults match the sidecar's live profile.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub high_capacity: usize,
    pub low_capacity: usize,
    pub batch_size: usize,
    pub high_poll: Duration,
    pub low_poll: Duration,
    pub seen_capacity: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            high_capacity: 64,
            low_capacity: 512,
            batch_size: 8,
            high_poll: Duration::from_millis(50),
            low_poll: Duration::from_millis(250),
            seen_capacity: 4096,
        }
    }
}

/// One translation job.
#[derive(Clone)]
pub struct QueueItem {
    pub id: String,
    pub text: String,
    /// Thread grouping key; batching only merges items sharing a key.
    pub key: String,
    pub batchable: bool,
    pub force: bool,
    /// Caller-supplied substitute shown when translation fails.
    pub fallback: Option<String>,
    /// Backend captured at enqueue time; a later hot-swap does not affect
    /// jobs already admitted.
    translator: Arc<dyn Translator>,
}

/// Completion report delivered through the pump's callback.
#[derive(Debug, Clone)]
pub struct TranslationOutcome {
    pub id: String,
    /// Translated text, or the caller-supplied fallback on failure.
    pub text: Option<String>,
    pub error: Option<String>,
    pub fallback_used: bool,
}

/// Counters snapshot for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PumpStats {
    pub queued_high: usize,
    pub queued_low: usize,
    pub inflight: usize,
    pub seen: usize,
    pub dropped_oldest: u64,
    pub completed: u64,
    pub failed: u64,
}

pub type DoneCallback = Arc<dyn Fn(TranslationOutcome) + Send + Sync>;

struct PumpState {
    high: VecDeque<QueueItem>,
    low: VecDeque<QueueItem>,
    /// Ids already auto-enqueued once. Bounded: full clear on overflow.
    seen: HashSet<String>,
    inflight: HashSet<String>,
    /// Single pending follow-up per in-flight id (coalesced force jobs).
    /// Invariant: a key here is always also in `inflight`.
    force_after: HashMap<String, QueueItem>,
    dropped_oldest: u64,
    completed: u64,
    failed: u64,
}

impl PumpState {
    fn new() -> Self {
        Self {
            high: VecDeque::new(),
            low: VecDeque::new(),
            seen: HashSet::new(),
            inflight: HashSet::new(),
            force_after: HashMap::new(),
            dropped_oldest: 0,
            completed: 0,
            failed: 0,
        }
    }

    /// Push with evict-oldest backpressure. Returns false when the item had
    /// to be dropped; the caller clears its in-flight mark.
    fn push_bounded(&mut self, high: bool, cap: usize, item: QueueItem) -> bool {
        let len = if high { self.high.len() } else { self.low.len() };
        if len >= cap {
            let old = if high { self.high.pop_front() } else { self.low.pop_front() };
            if let Some(old) = old {
                self.inflight.remove(&old.id);
                self.force_after.remove(&old.id);
                self.dropped_oldest += 1;
                debug!(id = %old.id, "queue full, evicted oldest translation job");
            }
        }
        let queue = if high { &mut self.high } else { &mut self.low };
        if queue.len() >= cap {
            return false;
        }
        queue.push_back(item);
        true
    }
}

/// The pump. Construct with [`TranslationPump::new`], then spawn
/// [`TranslationPump::run`] once; enqueue from any task.
pub struct TranslationPump {
    cfg: PumpConfig,
    state: Mutex<PumpState>,
    translator: Mutex<Option<Arc<dyn Translator>>>,
    on_done: DoneCallback,
}

impl TranslationPump {
    pub fn new(cfg: PumpConfig, on_done: DoneCallback) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            state: Mutex::new(PumpState::new()),
            translator: Mutex::new(None),
            on_done,
        })
    }

    /// Install (or clear) the active backend. Safe between calls: in-flight
    /// jobs keep the instance they captured.
    pub fn set_translator(&self, translator: Option<Arc<dyn Translator>>) {
        *self
            .translator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = translator;
    }

    pub fn has_translator(&self) -> bool {
        self.translator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Admit a job.
    ///
    /// Non-force jobs are rejected when the id was already seen (each id is
    /// auto-translated at most once). A force job for an in-flight id is
    /// coalesced into that id's single follow-up slot and runs exactly once
    /// after the current job completes. Returns whether the job was accepted.
    pub fn enqueue(
        &self,
        id: &str,
        text: &str,
        key: &str,
        batchable: bool,
        force: bool,
        fallback: Option<String>,
    ) -> bool {
        let translator = match self
            .translator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
        {
            Some(t) => t,
            None => return false,
        };

        let item = QueueItem {
            id: id.to_string(),
            text: text.to_string(),
            key: key.to_string(),
            batchable,
            force,
            fallback,
            translator,
        };

        let mut st = self.state();

        if !force {
            if st.seen.contains(id) {
                return false;
            }
            if st.seen.len() >= self.cfg.seen_capacity {
                // Coarse but predictable: drop the whole memory rather than
                // track recency per id.
                st.seen.clear();
            }
            st.seen.insert(id.to_string());
        }

        if force && st.inflight.contains(id) {
            // Coalesce: a newer force overwrites any earlier follow-up.
            st.force_after.insert(id.to_string(), item);
            return true;
        }

        st.inflight.insert(id.to_string());
        let high = force || !batchable;
        let cap = if high { self.cfg.high_capacity } else { self.cfg.low_capacity };
        if !st.push_bounded(high, cap, item) {
            st.inflight.remove(id);
            warn!(id, "translation queue full, job dropped");
            return false;
        }
        true
    }

    pub fn stats(&self) -> PumpStats {
        let st = self.state();
        PumpStats {
            queued_high: st.high.len(),
            queued_low: st.low.len(),
            inflight: st.inflight.len(),
            seen: st.seen.len(),
            dropped_oldest: st.dropped_oldest,
            completed: st.completed,
            failed: st.failed,
        }
    }

    /// Worker loop. Drains the local overflow buffer, then high with a short
    /// poll, then low with a longer one. Runs until cancelled; a cancel
    /// mid-batch abandons remaining items between translator calls.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut pending: VecDeque<QueueItem> = VecDeque::new();
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let item = pending.pop_front().or_else(|| self.pop_high());
            let item = match item {
                Some(item) => item,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.cfg.high_poll) => {}
                    }
                    match self.pop_high().or_else(|| self.pop_low()) {
                        Some(item) => item,
                        None => {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(self.cfg.low_poll) => {}
                            }
                            continue;
                        }
                    }
                }
            };

            self.process(item, &mut pending, &cancel).await;
        }
        debug!("translation pump worker stopped");
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PumpState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pop_high(&self) -> Option<QueueItem> {
        self.state().high.pop_front()
    }

    fn pop_low(&self) -> Option<QueueItem> {
        self.state().low.pop_front()
    }

    /// Opportunistically pull low-queue items batchable with `head`.
    /// Non-matching drained items land in the worker-local `pending` buffer
    /// in their original order.
    fn drain_batch(&self, head: QueueItem, pending: &mut VecDeque<QueueItem>) -> Vec<QueueItem> {
        let mut batch = vec![head];
        if !batch[0].batchable || batch[0].key.is_empty() {
            return batch;
        }
        let mut st = self.state();
        while batch.len() < self.cfg.batch_size {
            let candidate = match st.low.pop_front() {
                Some(c) => c,
                None => break,
            };
            let matches = candidate.batchable
                && candidate.key == batch[0].key
                && Arc::ptr_eq(&candidate.translator, &batch[0].translator);
            if matches {
                batch.push(candidate);
            } else {
                pending.push_back(candidate);
            }
        }
        batch
    }

    async fn process(
        &self,
        item: QueueItem,
        pending: &mut VecDeque<QueueItem>,
        cancel: &CancellationToken,
    ) {
        let mut batch = self.drain_batch(item, pending);
        if batch.len() == 1 {
            let item = batch.remove(0);
            let outcome = translate_one(&item).await;
            self.finish(item, outcome);
            return;
        }
        self.process_batch(batch, cancel).await;
    }

    async fn process_batch(&self, batch: Vec<QueueItem>, cancel: &CancellationToken) {
        let translator = batch[0].translator.clone();
        let pairs: Vec<(String, String)> = batch
            .iter()
            .map(|i| (i.id.clone(), i.text.clone()))
            .collect();
        let ids: Vec<String> = batch.iter().map(|i| i.id.clone()).collect();
        let packed = pack_batch(&pairs);

        let response = match translator.translate(&packed).await {
            Ok(resp) => resp,
            Err(err) => {
                // One failed call fails the whole batch; retrying item by
                // item would amplify a systemic outage into N requests.
                let msg = err.to_string();
                for item in batch {
                    self.finish_failed(item, msg.clone());
                }
                return;
            }
        };

        if response.trim().is_empty() {
            for item in batch {
                self.finish_failed(item, "empty batch response".to_string());
            }
            return;
        }

        let unpacked = unpack_batch(&response, &ids);
        // At most one individual retry per slot in the original batch.
        let mut fallback_budget = batch.len();

        for item in batch {
            match unpacked.get(&item.id) {
                Some(text) => {
                    let outcome = check_output(&item, text.clone());
                    self.finish(item, outcome);
                }
                None if fallback_budget > 0 && !cancel.is_cancelled() => {
                    fallback_budget -= 1;
                    debug!(id = %item.id, "batch marker missing, retrying individually");
                    let outcome = translate_one(&item).await;
                    self.finish(item, outcome);
                }
                None => {
                    self.finish_failed(item, "missing from batch response".to_string());
                }
            }
        }
    }

    fn finish_failed(&self, item: QueueItem, message: String) {
        let fallback = item.fallback.clone();
        let outcome = TranslationOutcome {
            id: item.id.clone(),
            fallback_used: fallback.is_some(),
            text: fallback,
            error: Some(message),
        };
        self.finish(item, outcome);
    }

    /// Single completion path: report, clear in-flight, then promote any
    /// coalesced follow-up to the high queue.
    fn finish(&self, item: QueueItem, outcome: TranslationOutcome) {
        let failed = outcome.error.is_some();
        (self.on_done)(outcome);

        let mut st = self.state();
        if failed {
            st.failed += 1;
        } else {
            st.completed += 1;
        }
        st.inflight.remove(&item.id);
        if let Some(follow) = st.force_after.remove(&item.id) {
            st.inflight.insert(follow.id.clone());
            let id = follow.id.clone();
            if !st.push_bounded(true, self.cfg.high_capacity, follow) {
                // Do not leave the id stuck in flight if even the high queue
                // cannot take the follow-up.
                st.inflight.remove(&id);
                warn!(id = %id, "dropped coalesced follow-up, high queue full");
            }
        }
    }

    #[cfg(test)]
    fn queued_ids(&self) -> (Vec<String>, Vec<String>) {
        let st = self.state();
        (
            st.high.iter().map(|i| i.id.clone()).collect(),
            st.low.iter().map(|i| i.id.clone()).collect(),
        )
    }
}

/// Translate one item and validate the structural contracts.
async fn translate_one(item: &QueueItem) -> TranslationOutcome {
    match item.translator.translate(&item.text).await {
        Ok(out) if out.trim().is_empty() => failed_outcome(item, TranslateError::Empty.to_string()),
        Ok(out) => check_output(item, out),
        Err(err) => failed_outcome(item, err.to_string()),
    }
}

fn check_output(item: &QueueItem, out: String) -> TranslationOutcome {
    if !preserves_markdown(&item.text, &out) {
        return failed_outcome(item, "markdown structure not preserved".to_string());
    }
    if looks_untranslated(&item.text, &out) {
        return failed_outcome(item, "output identical to input".to_string());
    }
    TranslationOutcome {
        id: item.id.clone(),
        text: Some(out),
        error: None,
        fallback_used: false,
    }
}

fn failed_outcome(item: &QueueItem, message: String) -> TranslationOutcome {
    TranslationOutcome {
        id: item.id.clone(),
        fallback_used: item.fallback.is_some(),
        text: item.fallback.clone(),
        error: Some(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Scripted backend: a handler closure plus a call counter, with an
    /// optional gate the test releases to let calls proceed.
    struct FakeTranslator {
        handler: Box<dyn Fn(&str) -> Result<String, TranslateError> + Send + Sync>,
        calls: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
    }

    impl FakeTranslator {
        fn new(
            handler: impl Fn(&str) -> Result<String, TranslateError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self { handler: Box::new(handler), calls: AtomicUsize::new(0), gate: None })
        }

        fn gated(
            gate: Arc<Semaphore>,
            handler: impl Fn(&str) -> Result<String, TranslateError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
                calls: AtomicUsize::new(0),
                gate: Some(gate),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Translator for FakeTranslator {
        async fn translate(&self, text: &str) -> Result<String, TranslateError> {
            if let Some(gate) = &self.gate {
                let permit = gate.acquire().await.expect("gate closed");
                permit.forget();
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.handler)(text)
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    fn collecting_pump(cfg: PumpConfig) -> (Arc<TranslationPump>, Arc<Mutex<Vec<TranslationOutcome>>>) {
        let outcomes: Arc<Mutex<Vec<TranslationOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let pump = TranslationPump::new(
            cfg,
            Arc::new(move |o| sink.lock().unwrap().push(o)),
        );
        (pump, outcomes)
    }

    fn fast_cfg() -> PumpConfig {
        PumpConfig {
            high_poll: Duration::from_millis(5),
            low_poll: Duration::from_millis(10),
            ..PumpConfig::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn enqueue_without_translator_is_rejected() {
        let (pump, _) = collecting_pump(PumpConfig::default());
        assert!(!pump.enqueue("a", "text", "", false, false, None));
    }

    #[test]
    fn duplicate_non_force_is_rejected_by_seen_set() {
        let (pump, _) = collecting_pump(PumpConfig::default());
        pump.set_translator(Some(FakeTranslator::new(|_| Ok("译".into()))));
        assert!(pump.enqueue("a", "text", "", false, false, None));
        assert!(!pump.enqueue("a", "text", "", false, false, None));
        assert_eq!(pump.stats().queued_high, 1);
    }

    #[test]
    fn backpressure_drops_oldest_and_keeps_newest() {
        let cfg = PumpConfig { high_capacity: 3, ..PumpConfig::default() };
        let (pump, _) = collecting_pump(cfg);
        pump.set_translator(Some(FakeTranslator::new(|_| Ok("译".into()))));

        for i in 0..4 {
            assert!(pump.enqueue(&format!("id{i}"), "t", "", false, false, None));
        }

        let stats = pump.stats();
        assert!(stats.dropped_oldest >= 1);
        let (high, _) = pump.queued_ids();
        assert!(high.contains(&"id3".to_string()), "newest must survive: {high:?}");
        assert!(!high.contains(&"id0".to_string()), "oldest must be evicted: {high:?}");
        // The evicted id is no longer considered in flight.
        assert_eq!(stats.inflight, 3);
    }

    #[test]
    fn batchable_jobs_land_on_low_queue() {
        let (pump, _) = collecting_pump(PumpConfig::default());
        pump.set_translator(Some(FakeTranslator::new(|_| Ok("译".into()))));
        pump.enqueue("a", "t", "thread-1", true, false, None);
        pump.enqueue("b", "t", "thread-1", false, false, None);
        let stats = pump.stats();
        assert_eq!(stats.queued_low, 1);
        assert_eq!(stats.queued_high, 1);
    }

    #[tokio::test]
    async fn worker_translates_and_reports() {
        let (pump, outcomes) = collecting_pump(fast_cfg());
        pump.set_translator(Some(FakeTranslator::new(|t| Ok(format!("{t}_zh")))));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(pump.clone().run(cancel.clone()));

        pump.enqueue("a", "hello there", "", false, false, None);
        wait_for(|| !outcomes.lock().unwrap().is_empty()).await;
        cancel.cancel();
        worker.await.unwrap();

        let got = outcomes.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "a");
        assert_eq!(got[0].text.as_deref(), Some("hello there_zh"));
        assert!(got[0].error.is_none());
        assert_eq!(pump.stats().completed, 1);
    }

    #[tokio::test]
    async fn coalesced_force_runs_exactly_once_after_completion() {
        let (pump, outcomes) = collecting_pump(fast_cfg());
        let gate = Arc::new(Semaphore::new(0));
        let translator = FakeTranslator::gated(gate.clone(), |t| Ok(format!("{t}_zh")));
        pump.set_translator(Some(translator.clone()));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(pump.clone().run(cancel.clone()));

        assert!(pump.enqueue("x", "original text", "", false, false, None));
        // Give the worker time to pick the job up; it is now parked inside
        // the translator gate.
        wait_for(|| pump.stats().queued_high == 0).await;

        // Force while in flight: coalesced, accepted, not queued.
        assert!(pump.enqueue("x", "forced text", "", false, true, None));
        assert_eq!(pump.stats().queued_high, 0);

        // A second force overwrites the first follow-up, never stacks.
        assert!(pump.enqueue("x", "forced text v2", "", false, true, None));

        gate.add_permits(2);
        wait_for(|| outcomes.lock().unwrap().len() == 2).await;
        cancel.cancel();
        worker.await.unwrap();

        let got = outcomes.lock().unwrap();
        assert_eq!(got.len(), 2, "exactly two outcomes, never more");
        assert_eq!(got[0].text.as_deref(), Some("original text_zh"));
        assert_eq!(got[1].text.as_deref(), Some("forced text v2_zh"));
        assert_eq!(translator.call_count(), 2);
        assert_eq!(pump.stats().inflight, 0);
    }

    #[tokio::test]
    async fn batch_packs_shared_key_and_unpacks_per_item() {
        let mut cfg = fast_cfg();
        cfg.batch_size = 4;
        let (pump, outcomes) = collecting_pump(cfg);
        // Echo each payload line back translated, markers verbatim.
        let translator = FakeTranslator::new(|req| {
            let mut out = String::new();
            let mut current: Option<String> = None;
            for line in req.lines() {
                if line.starts_with("<<<ITEM:") {
                    current = Some(line.to_string());
                    out.push_str(line);
                    out.push('\n');
                } else if line == "<<<END>>>" {
                    out.push_str(line);
                    out.push('\n');
                } else if current.is_some() && !line.is_empty() {
                    out.push_str(&format!("{line}_zh\n"));
                }
            }
            Ok(out)
        });
        pump.set_translator(Some(translator.clone()));

        // Enqueue to low while no worker runs, so one drain sees them all.
        pump.enqueue("a", "alpha", "thread-1", true, false, None);
        pump.enqueue("b", "beta", "thread-1", true, false, None);
        pump.enqueue("c", "gamma", "thread-1", true, false, None);

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(pump.clone().run(cancel.clone()));
        wait_for(|| outcomes.lock().unwrap().len() == 3).await;
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(translator.call_count(), 1, "one batched request");
        let got = outcomes.lock().unwrap();
        let by_id: HashMap<_, _> = got.iter().map(|o| (o.id.clone(), o.clone())).collect();
        assert_eq!(by_id["a"].text.as_deref(), Some("alpha_zh"));
        assert_eq!(by_id["b"].text.as_deref(), Some("beta_zh"));
        assert_eq!(by_id["c"].text.as_deref(), Some("gamma_zh"));
    }

    #[tokio::test]
    async fn missing_marker_falls_back_to_individual_call() {
        let mut cfg = fast_cfg();
        cfg.batch_size = 4;
        let (pump, outcomes) = collecting_pump(cfg);
        let translator = FakeTranslator::new(|req| {
            if req.starts_with("Translate every segment") {
                // Batched request: answer only the first item.
                Ok("<<<ITEM:a>>>\nalpha_zh\n<<<END>>>\n".to_string())
            } else {
                Ok(format!("{req}_zh"))
            }
        });
        pump.set_translator(Some(translator.clone()));

        pump.enqueue("a", "alpha", "thread-1", true, false, None);
        pump.enqueue("b", "beta", "thread-1", true, false, None);

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(pump.clone().run(cancel.clone()));
        wait_for(|| outcomes.lock().unwrap().len() == 2).await;
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(translator.call_count(), 2, "batch call plus one fallback");
        let got = outcomes.lock().unwrap();
        let by_id: HashMap<_, _> = got.iter().map(|o| (o.id.clone(), o.clone())).collect();
        assert_eq!(by_id["a"].text.as_deref(), Some("alpha_zh"));
        assert_eq!(by_id["b"].text.as_deref(), Some("beta_zh"));
    }

    #[tokio::test]
    async fn empty_batch_response_fails_every_item_without_fallback_calls() {
        let mut cfg = fast_cfg();
        cfg.batch_size = 4;
        let (pump, outcomes) = collecting_pump(cfg);
        let translator = FakeTranslator::new(|_| Ok("   \n".to_string()));
        pump.set_translator(Some(translator.clone()));

        pump.enqueue("a", "alpha", "thread-1", true, false, None);
        pump.enqueue("b", "beta", "thread-1", true, false, None);

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(pump.clone().run(cancel.clone()));
        wait_for(|| outcomes.lock().unwrap().len() == 2).await;
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(translator.call_count(), 1, "a failed batch is not retried per item");
        let got = outcomes.lock().unwrap();
        assert!(got.iter().all(|o| o.error.is_some()));
        assert_eq!(pump.stats().failed, 2);
    }

    #[tokio::test]
    async fn failure_substitutes_caller_fallback() {
        let (pump, outcomes) = collecting_pump(fast_cfg());
        pump.set_translator(Some(FakeTranslator::new(|_| {
            Err(TranslateError::Backend("WARN: upstream down".into()))
        })));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(pump.clone().run(cancel.clone()));

        pump.enqueue("a", "some text", "", false, true, Some("早先的翻译".into()));
        wait_for(|| !outcomes.lock().unwrap().is_empty()).await;
        cancel.cancel();
        worker.await.unwrap();

        let got = outcomes.lock().unwrap();
        assert_eq!(got[0].text.as_deref(), Some("早先的翻译"));
        assert!(got[0].fallback_used);
        assert_eq!(got[0].error.as_deref(), Some("WARN: upstream down"));
    }

    #[tokio::test]
    async fn untranslated_echo_is_reported_as_error() {
        let (pump, outcomes) = collecting_pump(fast_cfg());
        pump.set_translator(Some(FakeTranslator::new(|t| Ok(t.to_string()))));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(pump.clone().run(cancel.clone()));

        pump.enqueue(
            "a",
            "a long enough sentence that must not come back verbatim",
            "",
            false,
            false,
            None,
        );
        wait_for(|| !outcomes.lock().unwrap().is_empty()).await;
        cancel.cancel();
        worker.await.unwrap();

        let got = outcomes.lock().unwrap();
        assert_eq!(got[0].error.as_deref(), Some("output identical to input"));
        assert!(got[0].text.is_none());
    }
}
