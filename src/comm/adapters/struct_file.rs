//! 结构体定义文件（CSV）加载。
//!
//! 每行：`结构体名,成员类型1,成员类型2,...`
//! - 空行与 `#` 开头的行忽略
//! - 字段两端的引号与空白去掉
//! - 同名结构体重复出现时，后者覆盖前者

use std::path::Path;

use anyhow::Context;
use log::warn;

use crate::comm::core::layout::StructDefinitions;

pub fn parse_struct_definitions(content: &str) -> StructDefinitions {
    let mut definitions = StructDefinitions::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split(',').map(clean_field);
        let Some(name) = fields.next().filter(|name| !name.is_empty()) else {
            warn!("struct file line {}: missing structure name", line_no + 1);
            continue;
        };
        let members: Vec<String> = fields.filter(|field| !field.is_empty()).collect();

        if definitions.insert(name.clone(), members) {
            warn!("struct file line {}: '{name}' redefined, keeping the later definition", line_no + 1);
        }
    }

    definitions
}

pub fn load_struct_file(path: &Path) -> anyhow::Result<StructDefinitions> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read struct file failed: {}", path.display()))?;
    Ok(parse_struct_definitions(&content))
}

fn clean_field(field: &str) -> String {
    field.trim().trim_matches('"').trim().to_string()
}
