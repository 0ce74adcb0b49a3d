//! 读请求合并计划（optimise）：把同一父 tag 下的多个值合并为一次读取。
//!
//! 目标：
//! - 按 (poller, 父路径) 分组
//! - 组内成员数低于阈值则不合并
//! - 选出 master：优先选自身就是父 tag 的值，否则取最早注册的
//! - 输出顺序稳定（按首个成员的注册顺序）
//!
//! 第二层：父路径形如 `arr[i]` 的组属于同一个结构体数组时，把相邻元素合并成
//! 不超过一个 CIP 报文的数组切片读取。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::descriptor::ValueDescriptor;
use super::model::{DataType, ValueId, MAX_CIP_MESSAGE_DATA_SIZE};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OptimiseOptions {
    /// 小于该成员数的组不合并
    pub threshold: usize,
}

impl Default for OptimiseOptions {
    fn default() -> Self {
        Self { threshold: 2 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OptimisationGroup {
    pub poller: String,
    pub parent: String,
    pub master: ValueId,
    /// 注册顺序，包含 master
    pub members: Vec<ValueId>,
    /// master 自身的 tag 就是父 tag，可直接复用
    pub master_is_parent: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OptimisationPlan {
    pub groups: Vec<OptimisationGroup>,
    pub not_optimised: Vec<ValueId>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OptimisationError {
    #[error("optimisation error: could not create shared tag '{parent}' for poller '{poller}': {message}")]
    SharedTagCreation {
        poller: String,
        parent: String,
        message: String,
    },
}

fn eligible_parent(descriptor: &ValueDescriptor) -> Option<String> {
    // 共享缓冲区里的 STRING 需要已知容量才能定长读取
    if descriptor.data_type == DataType::String && descriptor.attributes.str_max_capacity.is_none() {
        return None;
    }
    descriptor.parent_path()
}

pub fn build_optimisation_plan(
    values: &[(ValueId, &ValueDescriptor)],
    options: &OptimiseOptions,
) -> OptimisationPlan {
    struct Seed<'a> {
        poller: String,
        parent: String,
        members: Vec<(ValueId, &'a ValueDescriptor)>,
    }

    let mut plan = OptimisationPlan::default();
    let mut seeds: Vec<Seed<'_>> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for (id, descriptor) in values {
        let Some(parent) = eligible_parent(descriptor) else {
            plan.not_optimised.push(*id);
            continue;
        };
        let key = (descriptor.poller_name().to_string(), parent);
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            seeds.push(Seed {
                poller: key.0.clone(),
                parent: key.1.clone(),
                members: Vec::new(),
            });
            seeds.len() - 1
        });
        seeds[slot].members.push((*id, *descriptor));
    }

    let threshold = options.threshold.max(1);
    for seed in seeds {
        if seed.members.len() < threshold {
            plan.not_optimised.extend(seed.members.iter().map(|(id, _)| *id));
            continue;
        }

        let parent_member = seed
            .members
            .iter()
            .find(|(_, d)| d.tag_name == seed.parent && d.elem_count() == 1);
        let (master, master_is_parent) = match parent_member {
            Some((id, _)) => (*id, true),
            None => (seed.members[0].0, false),
        };

        plan.groups.push(OptimisationGroup {
            poller: seed.poller,
            parent: seed.parent,
            master,
            members: seed.members.iter().map(|(id, _)| *id).collect(),
            master_is_parent,
        });
    }

    plan
}

/// 同一 poller 下、父路径是同一数组不同元素的合并组。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayFamily {
    pub poller: String,
    pub array: String,
    /// (元素下标, `OptimisationPlan::groups` 中的序号)，按下标升序
    pub elements: Vec<(usize, usize)>,
}

/// 一次读取的数组切片：`array[start]` 起 `elem_count` 个元素。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArraySlice {
    pub start: usize,
    pub elem_count: usize,
    pub elements: Vec<(usize, usize)>,
}

impl ArraySlice {
    /// 元素内偏移换算为切片缓冲区内的偏移；位偏移按 8 倍换算。
    pub fn rebase(&self, index: usize, element_size: usize, offset: usize, bit_addressed: bool) -> Option<usize> {
        let position = index.checked_sub(self.start)?;
        let bytes = position.checked_mul(element_size)?;
        let step = if bit_addressed { bytes.checked_mul(8)? } else { bytes };
        offset.checked_add(step)
    }
}

/// `name[12]` -> `("name", 12)`；多维或非数字下标不参与切片合并。
pub fn array_element(parent: &str) -> Option<(&str, usize)> {
    let inner = parent.strip_suffix(']')?;
    let open = inner.rfind('[')?;
    let array = &inner[..open];
    if array.is_empty() || array.ends_with(']') {
        return None;
    }
    let index = inner[open + 1..].parse::<usize>().ok()?;
    Some((array, index))
}

pub fn find_array_families(groups: &[OptimisationGroup]) -> Vec<ArrayFamily> {
    let mut families: Vec<ArrayFamily> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for (slot, group) in groups.iter().enumerate() {
        let Some((array, element)) = array_element(&group.parent) else {
            continue;
        };
        let key = (group.poller.clone(), array.to_string());
        let family = *index.entry(key).or_insert_with(|| {
            families.push(ArrayFamily {
                poller: group.poller.clone(),
                array: array.to_string(),
                elements: Vec::new(),
            });
            families.len() - 1
        });
        families[family].elements.push((element, slot));
    }

    families.retain(|family| family.elements.len() > 1);
    for family in &mut families {
        family.elements.sort();
    }
    families
}

impl ArrayFamily {
    /// 从最小的请求下标开始，每个切片最多容纳一个 CIP 报文能装下的元素；
    /// 只含一个元素的切片不输出（保持逐元素合并）。
    pub fn slices(&self, element_size: usize) -> Vec<ArraySlice> {
        let per_slice = MAX_CIP_MESSAGE_DATA_SIZE / element_size.max(1);
        if element_size == 0 || per_slice < 2 {
            return Vec::new();
        }

        let mut slices = Vec::new();
        let mut current: Option<ArraySlice> = None;
        for &(index, slot) in &self.elements {
            if let Some(slice) = current.as_mut() {
                if index - slice.start < per_slice {
                    slice.elem_count = index - slice.start + 1;
                    slice.elements.push((index, slot));
                    continue;
                }
            }
            if let Some(done) = current.take() {
                slices.push(done);
            }
            current = Some(ArraySlice {
                start: index,
                elem_count: 1,
                elements: vec![(index, slot)],
            });
        }
        slices.extend(current);
        slices.retain(|slice| slice.elements.len() > 1);
        slices
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use uuid::Uuid;

    use super::super::descriptor::{parse_descriptor, ParseContext};
    use super::super::layout::StructTable;
    use super::*;

    fn parse(text: &str) -> ValueDescriptor {
        let pollers: HashSet<String> = ["fast".to_string(), "slow".to_string()].into_iter().collect();
        let structs = StructTable::default();
        parse_descriptor(
            text,
            &ParseContext {
                pollers: &pollers,
                structs: &structs,
            },
        )
        .unwrap()
    }

    fn plan_for(texts: &[&str], threshold: usize) -> (Vec<ValueId>, OptimisationPlan) {
        let descriptors: Vec<ValueDescriptor> = texts.iter().map(|t| parse(t)).collect();
        let ids: Vec<ValueId> = (0..texts.len()).map(|i| Uuid::from_u128(i as u128 + 1)).collect();
        let values: Vec<(ValueId, &ValueDescriptor)> = ids.iter().copied().zip(descriptors.iter()).collect();
        let plan = build_optimisation_plan(&values, &OptimiseOptions { threshold });
        (ids, plan)
    }

    #[test]
    fn parent_path_ignores_dots_inside_brackets() {
        assert_eq!(parse("a.b.c DINT none none none").parent_path(), Some("a.b".to_string()));
        assert_eq!(parse("arr[1].x DINT none none none").parent_path(), Some("arr[1]".to_string()));
        assert_eq!(parse("plain DINT none none none").parent_path(), None);
        assert_eq!(parse("whole UDT none none &optimise=1").parent_path(), Some("whole".to_string()));
        assert!(parse("a.b DINT none none none").locates_field_in_parent());
        assert!(!parse("a.b DINT none none &optimise=1").locates_field_in_parent());
    }

    #[test]
    fn merges_siblings_and_picks_first_as_master() {
        let (ids, plan) = plan_for(
            &[
                "@fast parentA.fieldX REAL none 0 none",
                "@fast parentA.fieldY REAL none 4 none",
                "@fast other REAL none none none",
            ],
            2,
        );
        assert_eq!(plan.groups.len(), 1);
        let group = &plan.groups[0];
        assert_eq!(group.parent, "parentA");
        assert_eq!(group.master, ids[0]);
        assert_eq!(group.members, vec![ids[0], ids[1]]);
        assert!(!group.master_is_parent);
        assert_eq!(plan.not_optimised, vec![ids[2]]);
    }

    #[test]
    fn parent_value_becomes_master() {
        let (ids, plan) = plan_for(
            &[
                "@fast parentA.fieldX REAL none 0 none",
                "@fast parentA UDT none none &optimise=1",
            ],
            2,
        );
        assert_eq!(plan.groups[0].master, ids[1]);
        assert!(plan.groups[0].master_is_parent);
    }

    #[test]
    fn groups_are_split_by_poller_and_threshold() {
        let (ids, plan) = plan_for(
            &[
                "@fast p.a DINT none 0 none",
                "@slow p.b DINT none 4 none",
                "@fast p.c DINT none 8 none",
            ],
            2,
        );
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].poller, "fast");
        assert_eq!(plan.not_optimised, vec![ids[1]]);

        let (_, plan) = plan_for(&["@fast p.a DINT none 0 none", "@fast p.c DINT none 8 none"], 3);
        assert!(plan.groups.is_empty());
        assert_eq!(plan.not_optimised.len(), 2);
    }

    #[test]
    fn strings_without_capacity_are_not_merged() {
        let (ids, plan) = plan_for(
            &[
                "p.name STRING none 0 none",
                "p.id DINT none 84 none",
                "p.code STRING none 88 &str_max_capacity=8",
            ],
            2,
        );
        assert_eq!(plan.groups[0].members, vec![ids[1], ids[2]]);
        assert_eq!(plan.not_optimised, vec![ids[0]]);
    }

    fn element_groups(indices: &[usize]) -> Vec<OptimisationGroup> {
        indices
            .iter()
            .enumerate()
            .map(|(i, index)| OptimisationGroup {
                poller: "fast".to_string(),
                parent: format!("aPSU[{index}]"),
                master: Uuid::from_u128(i as u128 + 1),
                members: vec![Uuid::from_u128(i as u128 + 1)],
                master_is_parent: true,
            })
            .collect()
    }

    #[test]
    fn array_elements_need_a_single_numeric_index() {
        assert_eq!(array_element("aPSU[12]"), Some(("aPSU", 12)));
        assert_eq!(array_element("prog.aPSU[3]"), Some(("prog.aPSU", 3)));
        assert_eq!(array_element("grid[1][2]"), None);
        assert_eq!(array_element("aPSU[x]"), None);
        assert_eq!(array_element("aPSU"), None);
        assert_eq!(array_element("[4]"), None);
    }

    #[test]
    fn families_are_split_by_poller_and_need_two_elements() {
        let mut groups = element_groups(&[3, 1, 2]);
        groups[2].poller = "slow".to_string();
        groups.push(OptimisationGroup {
            parent: "other[1]".to_string(),
            ..groups[0].clone()
        });

        let families = find_array_families(&groups);
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].array, "aPSU");
        assert_eq!(families[0].poller, "fast");
        assert_eq!(families[0].elements, vec![(1, 1), (3, 0)]);
    }

    #[test]
    fn consecutive_elements_fill_cip_sized_slices() {
        let indices: Vec<usize> = (1..=136).collect();
        let families = find_array_families(&element_groups(&indices));
        let slices = families[0].slices(224);

        // 1994 / 224 = 8 个元素一片
        assert_eq!(slices.len(), 17);
        assert_eq!(slices[0].start, 1);
        assert_eq!(slices[0].elem_count, 8);
        assert_eq!(slices[1].start, 9);
        assert!(slices.iter().all(|slice| slice.elements.len() == 8));

        for i in 1..=8usize {
            assert_eq!(slices[0].rebase(i, 224, i, false), Some(i + 224 * (i - 1)));
        }
    }

    #[test]
    fn sparse_elements_share_slices_by_index_range() {
        let indices: Vec<usize> = (1..=136).step_by(4).collect();
        let families = find_array_families(&element_groups(&indices));
        let slices = families[0].slices(224);

        assert_eq!(slices[0].start, 1);
        assert_eq!(slices[0].elem_count, 5);
        assert_eq!(slices[0].elements.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 5]);
        assert_eq!(slices[0].rebase(5, 224, 5, false), Some(901));
        assert_eq!(slices[1].start, 9);
    }

    #[test]
    fn lone_or_oversized_elements_are_not_sliced() {
        let families = find_array_families(&element_groups(&[1, 2, 40]));
        let slices = families[0].slices(224);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].elements.len(), 2);

        assert!(families[0].slices(1000).is_empty());
        assert!(families[0].slices(0).is_empty());
    }

    #[test]
    fn bit_offsets_are_rebased_in_bits() {
        let slice = ArraySlice {
            start: 2,
            elem_count: 2,
            elements: vec![(2, 0), (3, 1)],
        };
        assert_eq!(slice.rebase(3, 16, 5, true), Some(16 * 8 + 5));
        assert_eq!(slice.rebase(1, 16, 5, true), None);
    }
}
