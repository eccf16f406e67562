//! Progress reporting for transfers.
//!
//! Many concurrent transfer tasks drive one ordinary, non-reentrant
//! [`ProgressSink`]. Tasks hold a cloneable [`ProgressReporter`] which turns
//! each call into a closure pushed onto a single ordered channel; one
//! consumer drains the channel in arrival order and invokes the sink
//! synchronously, so the sink never sees overlapping calls.

use std::future::Future;
use tokio::sync::mpsc;
use url::Url;

/// Receives transfer progress. Every method is optional.
pub trait ProgressSink: Send {
    fn start(&mut self, _src: &Url, _dst: &Url, _size: u64) {}

    fn step(&mut self, _src: &Url, _dst: &Url, _current: u64, _size: u64) {}

    fn complete(&mut self, _src: &Url, _dst: &Url, _size: u64) {}

    fn enter_dir(&mut self, _src: &Url, _dst: &Url) {}

    fn leave_dir(&mut self, _src: &Url, _dst: &Url) {}

    fn fail(&mut self, _src: &Url, _dst: &Url, _message: &str) {}

    fn delete(&mut self, _uri: &Url, _is_dir: bool) {}
}

/// A sink that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {}

type Queued = Box<dyn FnOnce(&mut dyn ProgressSink) + Send>;

enum Message {
    Event(Queued),
    Done,
}

/// Cloneable handle that queues progress calls for the consumer.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<Message>,
}

impl ProgressReporter {
    /// A reporter whose events go nowhere.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    fn push(&self, call: impl FnOnce(&mut dyn ProgressSink) + Send + 'static) {
        // the consumer only goes away after the sentinel, so a failed send
        // means nobody is listening anymore
        let _ = self.tx.send(Message::Event(Box::new(call)));
    }

    pub fn start(&self, src: &Url, dst: &Url, size: u64) {
        let (src, dst) = (src.clone(), dst.clone());
        self.push(move |sink| sink.start(&src, &dst, size));
    }

    pub fn step(&self, src: &Url, dst: &Url, current: u64, size: u64) {
        let (src, dst) = (src.clone(), dst.clone());
        self.push(move |sink| sink.step(&src, &dst, current, size));
    }

    pub fn complete(&self, src: &Url, dst: &Url, size: u64) {
        let (src, dst) = (src.clone(), dst.clone());
        self.push(move |sink| sink.complete(&src, &dst, size));
    }

    pub fn enter_dir(&self, src: &Url, dst: &Url) {
        let (src, dst) = (src.clone(), dst.clone());
        self.push(move |sink| sink.enter_dir(&src, &dst));
    }

    pub fn leave_dir(&self, src: &Url, dst: &Url) {
        let (src, dst) = (src.clone(), dst.clone());
        self.push(move |sink| sink.leave_dir(&src, &dst));
    }

    pub fn fail(&self, src: &Url, dst: &Url, message: &str) {
        let (src, dst, message) = (src.clone(), dst.clone(), message.to_string());
        self.push(move |sink| sink.fail(&src, &dst, &message));
    }

    pub fn delete(&self, uri: &Url, is_dir: bool) {
        let uri = uri.clone();
        self.push(move |sink| sink.delete(&uri, is_dir));
    }
}

/// Runs `work` with a reporter feeding `sink`.
///
/// Returns only after `work` has finished and every event it produced has
/// been delivered to the sink.
pub async fn run_with_progress<T, F, Fut>(sink: &mut dyn ProgressSink, work: F) -> T
where
    F: FnOnce(ProgressReporter) -> Fut,
    Fut: Future<Output = T>,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let reporter = ProgressReporter { tx: tx.clone() };

    let producer = async move {
        let result = work(reporter).await;
        let _ = tx.send(Message::Done);
        result
    };

    let consumer = async move {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Event(call) => call(&mut *sink),
                Message::Done => break,
            }
        }
    };

    let (result, ()) = tokio::join!(producer, consumer);
    result
}
