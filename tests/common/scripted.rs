//! Transport wrapper with scripted failures.

use channel_engine::position::ShardPosition;
use channel_engine::transport::{
    ChannelKind, InMemoryTransport, OutgoingRecord, PollResponse, RecordOutcome, Transport,
};
use channel_engine::{BoxFuture, ChannelError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Delegates to an [`InMemoryTransport`] but fails polls and records on demand.
pub struct ScriptedTransport {
    inner: Arc<InMemoryTransport>,
    failing_polls: AtomicUsize,
    polls: AtomicUsize,
    /// key -> (outcome to return instead of appending, remaining times)
    failing_keys: Mutex<HashMap<String, (RecordOutcome, usize)>>,
    put_calls: Mutex<Vec<Vec<String>>>,
    /// While true, polls wait before reaching the inner transport.
    held: watch::Sender<bool>,
}

impl ScriptedTransport {
    pub fn new(inner: Arc<InMemoryTransport>) -> Self {
        Self {
            inner,
            failing_polls: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            failing_keys: Mutex::new(HashMap::new()),
            put_calls: Mutex::new(Vec::new()),
            held: watch::channel(false).0,
        }
    }

    pub fn inner(&self) -> &Arc<InMemoryTransport> {
        &self.inner
    }

    /// The next `n` polls fail with a transport error.
    pub fn fail_polls(&self, n: usize) {
        self.failing_polls.store(n, Ordering::SeqCst);
    }

    /// Polls block until [`release_polls`](Self::release_polls) is called.
    pub fn hold_polls(&self) {
        self.held.send_replace(true);
    }

    pub fn release_polls(&self) {
        self.held.send_replace(false);
    }

    /// Polls attempted so far, including failed ones.
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Records keyed `key` get `outcome` for their next `times` submissions.
    pub fn fail_key(&self, key: &str, outcome: RecordOutcome, times: usize) {
        self.failing_keys
            .lock()
            .unwrap()
            .insert(key.to_string(), (outcome, times));
    }

    /// Keys submitted by each `put_batch` call, in call order.
    pub fn put_calls(&self) -> Vec<Vec<String>> {
        self.put_calls.lock().unwrap().clone()
    }

    /// Pops the scripted outcome for `key`, if one is left.
    fn scripted_outcome(&self, key: &str) -> Option<RecordOutcome> {
        let mut failing = self.failing_keys.lock().unwrap();
        let (outcome, remaining) = failing.get_mut(key)?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(outcome.clone())
    }
}

impl Transport for ScriptedTransport {
    fn channel_kind(&self, channel: &str) -> ChannelKind {
        self.inner.channel_kind(channel)
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    fn list_shards<'a>(&'a self, channel: &'a str) -> BoxFuture<'a, Vec<String>> {
        self.inner.list_shards(channel)
    }

    fn poll<'a>(
        &'a self,
        channel: &'a str,
        from: &'a ShardPosition,
        max_records: usize,
    ) -> BoxFuture<'a, PollResponse> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failing_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Box::pin(async move {
                Err(ChannelError::transport(channel, "poll", "scripted failure"))
            });
        }
        let mut held = self.held.subscribe();
        Box::pin(async move {
            let released = held.wait_for(|held| !*held).await.is_ok();
            if !released {
                return Err(ChannelError::Internal("poll gate closed".into()));
            }
            self.inner.poll(channel, from, max_records).await
        })
    }

    fn put_batch<'a>(
        &'a self,
        channel: &'a str,
        records: Vec<OutgoingRecord>,
    ) -> BoxFuture<'a, Vec<RecordOutcome>> {
        Box::pin(async move {
            self.put_calls
                .lock()
                .unwrap()
                .push(records.iter().map(|r| r.key.clone()).collect());

            // Scripted records are answered here; the rest go to the inner
            // transport and their outcomes are spliced back in order.
            let mut scripted: Vec<Option<RecordOutcome>> = Vec::with_capacity(records.len());
            let mut forwarded = Vec::new();
            for record in records {
                match self.scripted_outcome(&record.key) {
                    Some(outcome) => scripted.push(Some(outcome)),
                    None => {
                        scripted.push(None);
                        forwarded.push(record);
                    }
                }
            }

            let mut inner_outcomes = if forwarded.is_empty() {
                Vec::new().into_iter()
            } else {
                self.inner.put_batch(channel, forwarded).await?.into_iter()
            };

            scripted
                .into_iter()
                .map(|slot| match slot {
                    Some(outcome) => Ok(outcome),
                    None => inner_outcomes.next().ok_or_else(|| {
                        ChannelError::Internal("inner transport returned too few outcomes".into())
                    }),
                })
                .collect()
        })
    }
}
