use std::{fs, io, path::Path};

use taplo::formatter;

/// 用统一风格（4 空格缩进）格式化配置文件，内容有变化时才写回
///
/// 返回是否发生了改写
pub fn normalize_config_file(path: &Path) -> io::Result<bool> {
    let raw = fs::read_to_string(path)?;
    let formatted = format_toml(&raw);
    if formatted == raw {
        return Ok(false);
    }
    fs::write(path, formatted)?;
    Ok(true)
}

fn format_toml(input: &str) -> String {
    let options = formatter::Options {
        indent_string: "    ".to_string(),
        ..Default::default()
    };
    formatter::format(input, options)
}
