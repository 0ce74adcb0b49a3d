//! 轮询（poller）：按组发起读取、等待完成、解析并写入最新值缓存。
//!
//! 约束：
//! - 读取为非阻塞发起；之后按“每个值各自的超时”轮询状态
//! - 同一物理句柄只读一次；第一次观察到的完成结果对后续共享该句柄的值有效
//! - 停止信号在周期之间、以及每次等待前检查

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::comm::adapters::transport::{PhysicalTag, TagHandle, TagStatus, TransportError};
use crate::comm::core::codec::{decode_value, DecodeOptions};
use crate::comm::core::model::{PollStats, Quality, SampleResult, ValueId};
use crate::comm::usecase::registry::{RegisteredValue, RegistrySnapshot};

const STATUS_POLL_STEP: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, PartialEq)]
pub struct PollOptions {
    pub read_timeout: Duration,
    pub timezone_offset_hours: f64,
    /// 在该时间窗内把读请求均匀错开
    pub spread_over: Option<Duration>,
}

/// 最新值缓存（只读查询不触发采集）。
#[derive(Clone, Default)]
pub struct ValueStore {
    inner: Arc<Mutex<HashMap<ValueId, SampleResult>>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, result: SampleResult) {
        self.inner.lock().insert(result.value_id, result);
    }

    pub fn update(&self, results: &[SampleResult]) {
        let mut guard = self.inner.lock();
        for result in results {
            guard.insert(result.value_id, result.clone());
        }
    }

    pub fn get(&self, id: ValueId) -> Option<SampleResult> {
        self.inner.lock().get(&id).cloned()
    }
}

enum WaitOutcome {
    Done(Result<(), TransportError>),
    TimedOut,
    Cancelled,
}

fn stop_requested(stop_rx: Option<&watch::Receiver<bool>>) -> bool {
    stop_rx.map(|rx| *rx.borrow()).unwrap_or(false)
}

fn elapsed_ms(since: Instant) -> u32 {
    since.elapsed().as_millis().min(u128::from(u32::MAX)) as u32
}

pub async fn poll_group_once(
    snapshot: &RegistrySnapshot,
    group: &str,
    options: &PollOptions,
    stop_rx: Option<&watch::Receiver<bool>>,
) -> (Vec<SampleResult>, PollStats) {
    let values = snapshot.group(group);
    let now = Utc::now();

    let issued_at = issue_reads(values, options, stop_rx).await;
    let mut completions: HashMap<TagHandle, Result<(), TransportError>> = HashMap::new();
    for (handle, (_, early)) in &issued_at {
        if let Some(err) = early {
            completions.insert(*handle, Err(err.clone()));
        }
    }

    let mut results = Vec::with_capacity(values.len());
    for value in values {
        if stop_requested(stop_rx) {
            break;
        }
        let Some(tag) = value.tag.as_ref() else {
            let message = value
                .creation_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| TransportError::NoTag.to_string());
            results.push(SampleResult::failure(value.id, Quality::CommError, message, now, 0));
            continue;
        };

        let started = issued_at
            .get(&tag.handle())
            .map(|(at, _)| *at)
            .unwrap_or_else(Instant::now);
        let deadline = started + options.read_timeout;
        match wait_for_completion(tag, deadline, &mut completions, stop_rx).await {
            WaitOutcome::Cancelled => break,
            WaitOutcome::TimedOut => {
                let err = TransportError::Timeout {
                    handle: tag.handle(),
                    timeout_ms: options.read_timeout.as_millis() as u64,
                };
                results.push(SampleResult::failure(
                    value.id,
                    Quality::Timeout,
                    err.to_string(),
                    now,
                    elapsed_ms(started),
                ));
            }
            WaitOutcome::Done(Err(err)) => {
                results.push(SampleResult::failure(
                    value.id,
                    Quality::CommError,
                    err.to_string(),
                    now,
                    elapsed_ms(started),
                ));
            }
            WaitOutcome::Done(Ok(())) => {
                results.push(decode_result(value, tag, options, now, elapsed_ms(started)));
            }
        }
    }

    let stats = PollStats::from_results(&results);
    (results, stats)
}

/// 每个物理句柄只发起一次读取，记录发起时间（以及立即返回的错误）。
async fn issue_reads(
    values: &[RegisteredValue],
    options: &PollOptions,
    stop_rx: Option<&watch::Receiver<bool>>,
) -> HashMap<TagHandle, (Instant, Option<TransportError>)> {
    let mut seen = HashSet::new();
    let readers: Vec<&Arc<PhysicalTag>> = values
        .iter()
        .filter(|value| value.read_flag)
        .filter_map(|value| value.tag.as_ref())
        .filter(|tag| seen.insert(tag.handle()))
        .collect();

    let gap = options
        .spread_over
        .filter(|_| readers.len() > 1)
        .map(|window| window / readers.len() as u32);

    let mut issued = HashMap::with_capacity(readers.len());
    for (i, tag) in readers.iter().enumerate() {
        if i > 0 {
            if let Some(gap) = gap {
                if stop_requested(stop_rx) {
                    break;
                }
                tokio::time::sleep(gap).await;
            }
        }
        let early = tag.start_read().err();
        issued.insert(tag.handle(), (Instant::now(), early));
    }
    issued
}

async fn wait_for_completion(
    tag: &PhysicalTag,
    deadline: Instant,
    completions: &mut HashMap<TagHandle, Result<(), TransportError>>,
    stop_rx: Option<&watch::Receiver<bool>>,
) -> WaitOutcome {
    let handle = tag.handle();
    loop {
        if let Some(done) = completions.get(&handle) {
            return WaitOutcome::Done(done.clone());
        }
        match tag.status() {
            TagStatus::Ok => {
                completions.insert(handle, Ok(()));
            }
            TagStatus::Error(code) => {
                completions.insert(handle, Err(tag.status_error(code)));
            }
            TagStatus::Pending => {
                if Instant::now() >= deadline {
                    return WaitOutcome::TimedOut;
                }
                if stop_requested(stop_rx) {
                    return WaitOutcome::Cancelled;
                }
                tokio::time::sleep(STATUS_POLL_STEP).await;
            }
        }
    }
}

fn decode_result(
    value: &RegisteredValue,
    tag: &PhysicalTag,
    options: &PollOptions,
    timestamp: DateTime<Utc>,
    duration_ms: u32,
) -> SampleResult {
    let decode_options = DecodeOptions {
        shared_buffer: value.state.reads_shared_buffer(),
        timezone_offset_hours: options.timezone_offset_hours,
    };
    match decode_value(tag, &value.descriptor, decode_options) {
        Ok(decoded) => SampleResult {
            value_id: value.id,
            value_display: decoded.to_value_display(),
            value: Some(decoded),
            quality: Quality::Ok,
            timestamp,
            duration_ms,
            error_message: "".to_string(),
        },
        Err(err) => SampleResult::failure(value.id, Quality::DecodeError, err.to_string(), timestamp, duration_ms),
    }
}

pub(crate) struct PollerTask {
    pub name: String,
    /// None 表示只读取一次（初始化组）
    pub update_rate: Option<Duration>,
    pub options: PollOptions,
}

/// 后台轮询任务：等待合并快照发布后开始循环；stop 需在 1 秒内生效。
pub(crate) fn spawn_poller(
    task: PollerTask,
    mut snapshot_rx: watch::Receiver<Option<Arc<RegistrySnapshot>>>,
    mut stop_rx: watch::Receiver<bool>,
    store: ValueStore,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *stop_rx.borrow() {
                return;
            }
            if snapshot_rx.borrow().is_some() {
                break;
            }
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = snapshot_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        loop {
            if *stop_rx.borrow() {
                break;
            }
            let Some(snapshot) = snapshot_rx.borrow().clone() else {
                break;
            };

            let started = Instant::now();
            let (results, stats) = poll_group_once(&snapshot, &task.name, &task.options, Some(&stop_rx)).await;
            if stats.total > 0 && stats.ok < stats.total {
                warn!("poller {}: {}/{} values not ok ({:?})", task.name, stats.total - stats.ok, stats.total, stats);
            } else {
                debug!("poller {}: {} values ok in {} ms", task.name, stats.ok, elapsed_ms(started));
            }
            store.update(&results);

            let Some(rate) = task.update_rate else {
                break;
            };
            let wait = rate.saturating_sub(started.elapsed());
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    })
}
