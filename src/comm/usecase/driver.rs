//! 驱动门面（EipDriver）：注册值、合并读取、启动/停止轮询、查询最新值与写入。
//!
//! 约束（执行要求）：
//! - 注册与合并在同一把锁下完成
//! - 轮询任务在合并快照发布前不会读取注册表
//! - 合并完成后再注册的值会触发快照重新发布
//! - stop 需在 1 秒内生效

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::comm::adapters::struct_file::load_struct_file;
use crate::comm::adapters::transport::{PhysicalTag, TagStatus, TagTransport, TransportError};
use crate::comm::config::{validate_poller, ConfigError, DriverConfigV1, PollerConfig};
use crate::comm::core::codec::{encode_value, DecodeOptions, DecodedValue};
use crate::comm::core::descriptor::{DescriptorError, ValueDescriptor};
use crate::comm::core::layout::{DefinitionError, StructDefinitions, StructTable};
use crate::comm::core::model::{PollStats, Quality, SampleResult, ValueId, ValueInfo, INIT_POLLER};
use crate::comm::core::optimise::OptimiseOptions;
use crate::comm::error::BridgeError;
use crate::comm::usecase::poller::{poll_group_once, spawn_poller, PollOptions, PollerTask, ValueStore};
use crate::comm::usecase::registry::{OptimisationReport, Registry, RegistrySnapshot, TagFactory};

const STOP_BUDGET: Duration = Duration::from_secs(1);

pub struct EipDriver {
    config: DriverConfigV1,
    factory: TagFactory,
    registry: Mutex<Registry>,
    pollers: Mutex<Vec<PollerConfig>>,
    snapshot_tx: watch::Sender<Option<Arc<RegistrySnapshot>>>,
    stop_tx: watch::Sender<bool>,
    store: ValueStore,
    /// Some 表示已启动
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl EipDriver {
    pub fn new(config: DriverConfigV1, transport: Arc<dyn TagTransport>) -> Result<Self, BridgeError> {
        config.validate()?;

        let mut registry = Registry::new();
        for poller in &config.pollers {
            registry.add_poller(&poller.name);
        }
        let factory = TagFactory::new(transport, config.connection_prefix(), config.create_tag_timeout_ms);
        let (snapshot_tx, _) = watch::channel(None);
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            pollers: Mutex::new(config.pollers.clone()),
            config,
            factory,
            registry: Mutex::new(registry),
            snapshot_tx,
            stop_tx,
            store: ValueStore::new(),
            tasks: Mutex::new(None),
        })
    }

    /// 从配置文件构造；配置中的 `structFile` 相对配置文件所在目录解析。
    pub fn from_config_file(path: &Path, transport: Arc<dyn TagTransport>) -> anyhow::Result<Self> {
        let config = DriverConfigV1::load_from_file(path)?;
        let struct_file = config.struct_file.clone();
        let driver = Self::new(config, transport)?;

        if let Some(file) = struct_file {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            driver.load_struct_file(&base.join(file))?;
        }
        Ok(driver)
    }

    pub fn config(&self) -> &DriverConfigV1 {
        &self.config
    }

    /// 编译结构体定义。失败的结构体（及嵌入它的结构体）不可用，但其余照常生效；
    /// 返回按定义顺序的第一个错误。
    pub fn load_struct_definitions(&self, definitions: &StructDefinitions) -> Result<(), DefinitionError> {
        let table = StructTable::compile(definitions);
        let first_error = table.errors().next().map(|(_, err)| err.clone());
        self.registry.lock().set_structs(table);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn load_struct_file(&self, path: &Path) -> anyhow::Result<()> {
        let definitions = load_struct_file(path)?;
        self.load_struct_definitions(&definitions)
            .with_context(|| format!("struct file contains invalid definitions: {}", path.display()))
    }

    pub fn create_poller(&self, poller: PollerConfig) -> Result<(), BridgeError> {
        validate_poller(&poller)?;
        if !self.registry.lock().add_poller(&poller.name) {
            return Err(ConfigError::DuplicatePoller(poller.name).into());
        }

        let mut tasks = self.tasks.lock();
        if let Some(handles) = tasks.as_mut() {
            handles.push(self.spawn_group(&poller.name, Some(&poller)));
        }
        self.pollers.lock().push(poller);
        Ok(())
    }

    pub fn register_value(&self, text: &str) -> Result<ValueId, DescriptorError> {
        let (id, creation_error, republish) = {
            let mut registry = self.registry.lock();
            let id = registry.register(text, &self.factory)?;
            let creation_error = registry.get(id).and_then(|v| v.creation_error.clone());
            (id, creation_error, registry.is_optimised())
        };

        let now = chrono::Utc::now();
        let initial = match creation_error {
            Some(err) => SampleResult::failure(id, Quality::CommError, err.to_string(), now, 0),
            None => SampleResult::failure(id, Quality::ConfigError, "not polled yet", now, 0),
        };
        self.store.insert(initial);

        if republish {
            self.publish();
        }
        Ok(id)
    }

    /// 合并读取并发布快照；之后轮询任务才开始工作。
    pub fn run_optimisation_pass(&self) -> OptimisationReport {
        let report = {
            let mut registry = self.registry.lock();
            registry.apply_optimisation(
                &OptimiseOptions {
                    threshold: self.config.optimise_threshold,
                },
                &self.factory,
            )
        };
        for failure in &report.failures {
            warn!("{failure}");
        }
        info!(
            "optimisation pass: {} groups merged, {} array slices, {} values merged, {} not optimised",
            report.groups_merged, report.slices_merged, report.values_merged, report.not_optimised
        );
        self.publish();
        report
    }

    pub fn snapshot(&self) -> Option<Arc<RegistrySnapshot>> {
        self.snapshot_tx.borrow().clone()
    }

    /// 对某个组执行一次读取，并更新最新值缓存。
    pub async fn poll_group(&self, name: &str) -> Result<(Vec<SampleResult>, PollStats), BridgeError> {
        let snapshot = self.snapshot().ok_or(BridgeError::NotInitialised)?;
        let poller = if name == INIT_POLLER {
            None
        } else {
            let found = self.pollers.lock().iter().find(|p| p.name == name).cloned();
            Some(found.ok_or_else(|| BridgeError::UnknownPoller(name.to_string()))?)
        };

        let options = self.poll_options(poller.as_ref());
        let stop_rx = self.stop_tx.subscribe();
        let (results, stats) = poll_group_once(&snapshot, name, &options, Some(&stop_rx)).await;
        self.store.update(&results);
        Ok((results, stats))
    }

    /// 启动所有轮询任务与一次性的合并任务（若尚未合并）。重复调用无效果。
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return;
        }

        let mut handles = Vec::new();
        handles.push(self.spawn_group(INIT_POLLER, None));
        for poller in self.pollers.lock().iter() {
            handles.push(self.spawn_group(&poller.name, Some(poller)));
        }

        if self.snapshot().is_none() {
            let driver = Arc::clone(self);
            handles.push(tokio::task::spawn_blocking(move || {
                driver.run_optimisation_pass();
            }));
        }
        *tasks = Some(handles);
    }

    /// 通知所有任务停止并等待退出（总计不超过 1 秒）。全部干净退出时返回 true。
    pub async fn stop(&self) -> bool {
        self.stop_tx.send_replace(true);
        let handles = self.tasks.lock().take().unwrap_or_default();

        let deadline = Instant::now() + STOP_BUDGET;
        let mut clean = true;
        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                _ => clean = false,
            }
        }
        clean
    }

    pub fn latest(&self, id: ValueId) -> Option<SampleResult> {
        self.store.get(id)
    }

    pub fn value_info(&self, id: ValueId) -> Option<ValueInfo> {
        self.registry.lock().get(id).map(|value| value.info())
    }

    /// 写入一个值。读取用的 tag 被多个值共享时，另建一个临时 tag：
    /// 先读回整块数据，再改写该值的字段并写出，避免覆盖其他字段。
    pub async fn write_value(&self, id: ValueId, value: DecodedValue) -> Result<(), BridgeError> {
        let (entry, shared) = {
            let registry = self.registry.lock();
            let entry = registry.get(id).cloned().ok_or(BridgeError::UnknownValue(id))?;
            let shared = registry.shares_tag(id) || entry.state.reads_shared_buffer();
            (entry, shared)
        };

        let tag = match &entry.tag {
            Some(tag) if !shared => Arc::clone(tag),
            _ => self.factory.create(&entry.connection)?,
        };
        let timeout = Duration::from_millis(self.config.read_timeout_ms);

        tag.start_read()?;
        wait_idle(&tag, timeout).await?;

        let options = DecodeOptions {
            shared_buffer: false,
            timezone_offset_hours: self.config.timezone_offset_hours,
        };
        let descriptor = match entry.element_offset {
            Some(offset) => Arc::new(ValueDescriptor {
                offset,
                ..(*entry.descriptor).clone()
            }),
            None => Arc::clone(&entry.descriptor),
        };
        encode_value(&*tag, &descriptor, &value, options)?;
        tag.start_write()?;
        wait_idle(&tag, timeout).await?;
        Ok(())
    }

    fn poll_options(&self, poller: Option<&PollerConfig>) -> PollOptions {
        PollOptions {
            read_timeout: Duration::from_millis(self.config.read_timeout_ms),
            timezone_offset_hours: self.config.timezone_offset_hours,
            spread_over: poller
                .filter(|p| p.spread_requests)
                .map(|p| Duration::from_millis(p.update_rate_ms)),
        }
    }

    fn spawn_group(&self, name: &str, poller: Option<&PollerConfig>) -> JoinHandle<()> {
        spawn_poller(
            PollerTask {
                name: name.to_string(),
                update_rate: poller.map(|p| Duration::from_millis(p.update_rate_ms)),
                options: self.poll_options(poller),
            },
            self.snapshot_tx.subscribe(),
            self.stop_tx.subscribe(),
            self.store.clone(),
        )
    }

    fn publish(&self) {
        let snapshot = Arc::new(self.registry.lock().snapshot());
        self.snapshot_tx.send_replace(Some(snapshot));
    }
}

async fn wait_idle(tag: &PhysicalTag, timeout: Duration) -> Result<(), TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
        match tag.status() {
            TagStatus::Ok => return Ok(()),
            TagStatus::Error(code) => return Err(tag.status_error(code)),
            TagStatus::Pending => {
                if Instant::now() >= deadline {
                    return Err(TransportError::Timeout {
                        handle: tag.handle(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }
}
