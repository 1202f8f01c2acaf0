//! 报告文件在磁盘上的确定性布局：`<根目录>/<分类>/<标题>/<标题>.<扩展名>`。

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use reqwest::Url;
use sha2::{Digest, Sha256};

pub const STAGING_SUFFIX: &str = ".part";
const DEFAULT_EXTENSION: &str = "zip";
const NAME_MAX_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLayout {
    root: PathBuf,
}

impl ReportLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 分类名未知时使用 `category_<id>` 作为目录名。
    pub fn report_dir(&self, category_id: &str, category_name: Option<&str>, title: &str) -> PathBuf {
        let category = match category_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => safe_fs_name(name, NAME_MAX_LEN),
            None => safe_fs_name(&format!("category_{category_id}"), NAME_MAX_LEN),
        };
        self.root.join(category).join(safe_fs_name(title, NAME_MAX_LEN))
    }

    pub fn expected_file_path(
        &self,
        category_id: &str,
        category_name: Option<&str>,
        title: &str,
        download_url: Option<&str>,
    ) -> PathBuf {
        let ext = download_url
            .and_then(extension_from_url)
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
        let stem = safe_fs_name(title, NAME_MAX_LEN);
        self.report_dir(category_id, category_name, title)
            .join(format!("{stem}.{ext}"))
    }
}

/// 下载中的暂存文件路径：在最终文件名后追加 `.part`。
pub fn staging_path(final_path: &Path) -> PathBuf {
    let mut name: OsString = final_path.as_os_str().to_os_string();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

/// 由来源页面 URL 派生稳定的报告 id（sha256 前 16 位十六进制）。
pub fn derive_report_id(source_url: &str) -> String {
    let digest = Sha256::digest(source_url.trim().as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// 取 URL 路径最后一段的扩展名（忽略查询参数），只接受 1-5 位字母数字。
pub fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    let valid = (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

/// 生成可在各平台使用的文件/目录名。
///
/// 非法字符与控制字符替换为 `_`，连续的 `_` 合并；去掉首尾空格、点和下划线；
/// Windows 保留名前加 `_`；超长时按字符边界截断。
pub fn safe_fs_name(name: &str, max_len: usize) -> String {
    let mut cleaned = String::with_capacity(name.len());
    for ch in name.chars() {
        let mapped = match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        };
        if mapped == '_' && cleaned.ends_with('_') {
            continue;
        }
        cleaned.push(mapped);
    }

    let mut cleaned = cleaned
        .trim_matches(|c: char| c == ' ' || c == '.' || c == '_')
        .to_string();

    if cleaned.len() > max_len {
        let mut end = max_len;
        while !cleaned.is_char_boundary(end) {
            end -= 1;
        }
        cleaned.truncate(end);
        cleaned = cleaned.trim_end_matches([' ', '.', '_']).to_string();
    }

    if cleaned.is_empty() {
        return "unnamed".to_string();
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if RESERVED.contains(&cleaned.to_uppercase().as_str()) {
        cleaned.insert(0, '_');
    }

    cleaned
}
