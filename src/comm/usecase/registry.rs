//! 值注册表（registry）：描述符注册、物理 tag 去重、合并计划落地与快照发布。
//!
//! 注册与合并都在驱动的一把锁下进行；轮询线程只读取发布出去的不可变快照。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::comm::adapters::transport::{PhysicalTag, TagTransport, TransportError};
use crate::comm::core::attributes::TagAttributes;
use crate::comm::core::codec::TagBuffer;
use crate::comm::core::descriptor::{parse_descriptor, DescriptorError, OffsetSource, ParseContext, ValueDescriptor};
use crate::comm::core::layout::StructTable;
use crate::comm::core::model::{DataType, OptimisationState, ValueId, ValueInfo};
use crate::comm::core::optimise::{
    build_optimisation_plan, find_array_families, ArrayFamily, OptimisationError, OptimisationGroup, OptimiseOptions,
};

/// 按连接串创建物理 tag。
pub struct TagFactory {
    transport: Arc<dyn TagTransport>,
    prefix: String,
    create_timeout_ms: u64,
}

impl TagFactory {
    pub fn new(transport: Arc<dyn TagTransport>, prefix: String, create_timeout_ms: u64) -> Self {
        Self {
            transport,
            prefix,
            create_timeout_ms,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn create(&self, connection: &str) -> Result<Arc<PhysicalTag>, TransportError> {
        PhysicalTag::create(Arc::clone(&self.transport), connection, self.create_timeout_ms)
    }
}

#[derive(Clone, Debug)]
pub struct RegisteredValue {
    pub id: ValueId,
    pub descriptor: Arc<ValueDescriptor>,
    /// 值自身的连接串（合并后读取可能改用父 tag）
    pub connection: String,
    pub state: OptimisationState,
    pub tag: Option<Arc<PhysicalTag>>,
    /// 轮询时是否由本值发起读取
    pub read_flag: bool,
    pub creation_error: Option<TransportError>,
    /// 并入数组切片前、相对元素自身的偏移；写入仍按元素 tag 进行
    pub element_offset: Option<usize>,
}

impl RegisteredValue {
    pub fn poller(&self) -> &str {
        self.descriptor.poller_name()
    }

    pub fn info(&self) -> ValueInfo {
        ValueInfo {
            value_id: self.id,
            tag_name: self.descriptor.tag_name.clone(),
            poller: self.poller().to_string(),
            connection: self
                .tag
                .as_ref()
                .map(|tag| tag.connection().to_string())
                .unwrap_or_else(|| self.connection.clone()),
            state: self.state,
            handle: self.tag.as_ref().map(|tag| tag.handle()),
            read_flag: self.read_flag,
            offset: self.descriptor.offset,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OptimisationReport {
    pub groups_merged: usize,
    pub values_merged: usize,
    /// 结构体数组切片（`elem_count > 1` 的共享读取）数量
    pub slices_merged: usize,
    pub not_optimised: usize,
    pub failures: Vec<OptimisationError>,
}

/// Immutable view handed to pollers after the optimisation pass.
#[derive(Clone, Debug, Default)]
pub struct RegistrySnapshot {
    groups: HashMap<String, Vec<RegisteredValue>>,
}

impl RegistrySnapshot {
    pub fn group(&self, name: &str) -> &[RegisteredValue] {
        self.groups.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn value(&self, id: ValueId) -> Option<&RegisteredValue> {
        self.groups.values().flatten().find(|value| value.id == id)
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct Registry {
    values: Vec<RegisteredValue>,
    index: HashMap<ValueId, usize>,
    pollers: HashSet<String>,
    structs: StructTable,
    optimised: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_poller(&mut self, name: &str) -> bool {
        self.pollers.insert(name.to_string())
    }

    pub fn has_poller(&self, name: &str) -> bool {
        self.pollers.contains(name)
    }

    pub fn set_structs(&mut self, structs: StructTable) {
        self.structs = structs;
    }

    pub fn is_optimised(&self) -> bool {
        self.optimised
    }

    pub fn values(&self) -> &[RegisteredValue] {
        &self.values
    }

    pub fn get(&self, id: ValueId) -> Option<&RegisteredValue> {
        self.index.get(&id).map(|i| &self.values[*i])
    }

    /// 其他值也引用同一个物理句柄。
    pub fn shares_tag(&self, id: ValueId) -> bool {
        let Some(handle) = self.get(id).and_then(|v| v.tag.as_ref()).map(|t| t.handle()) else {
            return false;
        };
        self.values
            .iter()
            .filter(|v| v.tag.as_ref().map(|t| t.handle()) == Some(handle))
            .count()
            > 1
    }

    /// 解析并登记一个值。描述符非法时整条拒绝；物理 tag 创建失败时仍登记，
    /// 只是没有句柄，轮询时报告通讯错误。
    pub fn register(&mut self, text: &str, factory: &TagFactory) -> Result<ValueId, DescriptorError> {
        let descriptor = parse_descriptor(
            text,
            &ParseContext {
                pollers: &self.pollers,
                structs: &self.structs,
            },
        )
        .map_err(|err| {
            error!("rejected descriptor '{text}': {err}");
            err
        })?;
        debug!("parsed descriptor: {descriptor:?}");

        let connection = descriptor.connection_string(factory.prefix());
        let (tag, creation_error) = match self.find_tag(&connection) {
            Some(tag) => {
                debug!("reusing tag {} for {}", tag.handle(), descriptor.tag_name);
                (Some(tag), None)
            }
            None => match factory.create(&connection) {
                Ok(tag) => (Some(tag), None),
                Err(err) => {
                    warn!("tag 创建失败，值将处于报警状态: {err}");
                    (None, Some(err))
                }
            },
        };

        let id = ValueId::new_v4();
        let state = if self.optimised {
            OptimisationState::DoNotOptimize
        } else {
            OptimisationState::NotRequested
        };
        self.index.insert(id, self.values.len());
        self.values.push(RegisteredValue {
            id,
            descriptor: Arc::new(descriptor),
            connection,
            state,
            tag,
            read_flag: true,
            creation_error,
            element_offset: None,
        });
        Ok(id)
    }

    fn find_tag(&self, connection: &str) -> Option<Arc<PhysicalTag>> {
        self.values
            .iter()
            .filter_map(|value| value.tag.as_ref())
            .find(|tag| tag.connection() == connection)
            .cloned()
    }

    /// 执行合并：只处理尚未参与过合并的值，可重复调用。
    pub fn apply_optimisation(&mut self, options: &OptimiseOptions, factory: &TagFactory) -> OptimisationReport {
        let plan = {
            let candidates: Vec<(ValueId, &ValueDescriptor)> = self
                .values
                .iter()
                .filter(|value| value.state == OptimisationState::NotRequested)
                .map(|value| (value.id, value.descriptor.as_ref()))
                .collect();
            build_optimisation_plan(&candidates, options)
        };

        let mut report = OptimisationReport {
            not_optimised: plan.not_optimised.len(),
            ..OptimisationReport::default()
        };
        for id in &plan.not_optimised {
            self.set_state(*id, OptimisationState::DoNotOptimize);
        }

        // 第一层合并成功的组，记下共享 tag，供数组切片使用
        let mut merged: Vec<Option<Arc<PhysicalTag>>> = vec![None; plan.groups.len()];
        for (slot, group) in plan.groups.iter().enumerate() {
            for id in &group.members {
                self.set_state(*id, OptimisationState::PendingOptimization);
            }

            let master = self.get(group.master).cloned();
            let allow_packing = master
                .as_ref()
                .map(|m| m.descriptor.attributes.allow_packing)
                .unwrap_or(true);
            let connection = format!(
                "{}&name={}&elem_count=1{}",
                factory.prefix(),
                group.parent,
                TagAttributes::shared_parent(allow_packing).render(DataType::Udt)
            );

            let existing = if group.master_is_parent {
                master.and_then(|m| m.tag)
            } else {
                None
            };
            let shared = match existing.or_else(|| self.find_tag(&connection)) {
                Some(tag) => Ok(tag),
                None => factory.create(&connection),
            };

            match shared {
                Ok(tag) => {
                    for id in &group.members {
                        let Some(value) = self.get_mut(*id) else { continue };
                        value.tag = Some(Arc::clone(&tag));
                        value.creation_error = None;
                        if *id == group.master {
                            value.state = OptimisationState::Master;
                            value.read_flag = true;
                        } else {
                            value.state = OptimisationState::Optimized;
                            value.read_flag = false;
                            if value.descriptor.offset_source == OffsetSource::Unspecified {
                                warn!(
                                    "'{}' shares '{}' but has no offset, it will read from byte 0",
                                    value.descriptor.tag_name, group.parent
                                );
                            }
                        }
                    }
                    report.groups_merged += 1;
                    report.values_merged += group.members.len() - 1;
                    info!(
                        "合并读取: poller={} parent={} members={} handle={}",
                        group.poller,
                        group.parent,
                        group.members.len(),
                        tag.handle()
                    );
                    merged[slot] = Some(tag);
                }
                Err(err) => {
                    warn!("merge of '{}' failed, members keep their own tags: {err}", group.parent);
                    for id in &group.members {
                        self.set_state(*id, OptimisationState::OptimizationFailed);
                    }
                    report.failures.push(OptimisationError::SharedTagCreation {
                        poller: group.poller.clone(),
                        parent: group.parent.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        for family in find_array_families(&plan.groups) {
            self.merge_array_slices(&family, &plan.groups, &merged, factory, &mut report);
        }

        self.optimised = true;
        report
    }

    /// 第二层合并：同一数组的多个元素组合并成若干 `elem_count = n` 的切片读取。
    ///
    /// 切片失败时各元素保留第一层的共享 tag。
    fn merge_array_slices(
        &mut self,
        family: &ArrayFamily,
        groups: &[OptimisationGroup],
        merged: &[Option<Arc<PhysicalTag>>],
        factory: &TagFactory,
        report: &mut OptimisationReport,
    ) {
        let usable = ArrayFamily {
            poller: family.poller.clone(),
            array: family.array.clone(),
            elements: family
                .elements
                .iter()
                .copied()
                .filter(|(_, slot)| merged.get(*slot).is_some_and(Option::is_some))
                .collect(),
        };
        let Some(first_tag) = usable.elements.first().and_then(|(_, slot)| merged[*slot].as_ref()) else {
            return;
        };
        let element_size = match first_tag.size() {
            Ok(size) => size,
            Err(err) => {
                warn!("cannot size elements of '{}', array not sliced: {err}", usable.array);
                return;
            }
        };

        for slice in usable.slices(element_size) {
            let Some(&(_, first_slot)) = slice.elements.first() else { continue };
            let master = groups[first_slot].master;

            let mut rebased = Vec::new();
            for &(index, slot) in &slice.elements {
                for id in &groups[slot].members {
                    let Some(value) = self.get(*id) else { continue };
                    let descriptor = &value.descriptor;
                    match slice.rebase(index, element_size, descriptor.offset, descriptor.bit_addressed) {
                        Some(offset) => rebased.push((*id, offset)),
                        None => break,
                    }
                }
            }
            let member_count: usize = slice.elements.iter().map(|(_, slot)| groups[*slot].members.len()).sum();
            if rebased.len() != member_count {
                warn!("offsets in slice '{}[{}]' overflow, slice skipped", usable.array, slice.start);
                continue;
            }

            let allow_packing = self
                .get(master)
                .map(|m| m.descriptor.attributes.allow_packing)
                .unwrap_or(true);
            let connection = format!(
                "{}&name={}[{}]&elem_count={}{}",
                factory.prefix(),
                usable.array,
                slice.start,
                slice.elem_count,
                TagAttributes::shared_parent(allow_packing).render(DataType::Udt)
            );
            let tag = match factory.create(&connection) {
                Ok(tag) => tag,
                Err(err) => {
                    warn!(
                        "slice '{}[{}]' x{} failed, elements keep their own tags: {err}",
                        usable.array, slice.start, slice.elem_count
                    );
                    report.failures.push(OptimisationError::SharedTagCreation {
                        poller: usable.poller.clone(),
                        parent: format!("{}[{}]", usable.array, slice.start),
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            for (id, offset) in rebased {
                let Some(value) = self.get_mut(id) else { continue };
                value.element_offset = Some(value.descriptor.offset);
                Arc::make_mut(&mut value.descriptor).offset = offset;
                value.tag = Some(Arc::clone(&tag));
                if id == master {
                    value.state = OptimisationState::Master;
                    value.read_flag = true;
                } else {
                    value.state = OptimisationState::Optimized;
                    value.read_flag = false;
                }
            }
            report.slices_merged += 1;
            report.values_merged += slice.elements.len() - 1;
            info!(
                "数组切片: poller={} array={} start={} elem_count={} handle={}",
                usable.poller,
                usable.array,
                slice.start,
                slice.elem_count,
                tag.handle()
            );
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut groups: HashMap<String, Vec<RegisteredValue>> = HashMap::new();
        for value in &self.values {
            groups
                .entry(value.poller().to_string())
                .or_default()
                .push(value.clone());
        }
        RegistrySnapshot { groups }
    }

    fn get_mut(&mut self, id: ValueId) -> Option<&mut RegisteredValue> {
        let index = *self.index.get(&id)?;
        self.values.get_mut(index)
    }

    fn set_state(&mut self, id: ValueId, state: OptimisationState) {
        if let Some(value) = self.get_mut(id) {
            value.state = state;
        }
    }
}
