//! ZIP 解压：只接受安全的相对路径，文档按 `<日期><标题><扩展名>` 重命名。

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::{debug, warn};
use zip::ZipArchive;

use super::{ExtractError, ExtractionSummary, Extractor};
use crate::store::layout::safe_fs_name;

const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "ppt", "pptx", "xls", "xlsx"];
const NAME_MAX_LEN: usize = 200;

static RE_DATES: OnceLock<[Regex; 4]> = OnceLock::new();

/// 依次尝试：开头的 14 位时间戳、开头 8 位、后接下划线、前接下划线。
fn re_dates() -> &'static [Regex; 4] {
    RE_DATES.get_or_init(|| {
        [
            Regex::new(r"^(\d{14})").expect("compile RE_TIMESTAMP"),
            Regex::new(r"^(\d{8})").expect("compile RE_DATE_PREFIX"),
            Regex::new(r"(\d{8})_").expect("compile RE_DATE_BEFORE_US"),
            Regex::new(r"_(\d{8})").expect("compile RE_DATE_AFTER_US"),
        ]
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExtractor {
    rename_documents: bool,
}

impl ZipExtractor {
    pub fn new(rename_documents: bool) -> Self {
        Self { rename_documents }
    }
}

impl Extractor for ZipExtractor {
    fn supports(&self, archive: &Path) -> bool {
        archive
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
    }

    fn extract(&self, archive: &Path, output_dir: &Path) -> Result<ExtractionSummary, ExtractError> {
        if !self.supports(archive) {
            return Err(ExtractError::UnsupportedFormat(archive.to_path_buf()));
        }
        let file = File::open(archive).map_err(|e| ExtractError::io(archive, e))?;
        let mut zip = ZipArchive::new(file)?;
        fs::create_dir_all(output_dir).map_err(|e| ExtractError::io(output_dir, e))?;

        let naming = DocumentNaming::for_archive(archive);
        let mut used = HashSet::new();
        let mut files = Vec::new();

        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let Some(relative) = entry.enclosed_name().and_then(sanitize_entry_path) else {
                warn!(target: "extract", "跳过不安全的条目：{}", entry.name());
                continue;
            };
            let target = output_dir.join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&target).map_err(|e| ExtractError::io(&target, e))?;
                continue;
            }
            if target == archive {
                warn!(target: "extract", "条目与压缩包同名，跳过：{}", target.display());
                continue;
            }
            // 不能覆盖本次解压已产出的文件（包括重命名后的文档）
            let target = unused_path(target, &used);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| ExtractError::io(parent, e))?;
            }
            let mut out = File::create(&target).map_err(|e| ExtractError::io(&target, e))?;
            io::copy(&mut entry, &mut out).map_err(|e| ExtractError::io(&target, e))?;
            drop(out);

            let target = if self.rename_documents && is_document(&target) {
                naming
                    .rename(&target, &used)
                    .map_err(|e| ExtractError::io(&target, e))?
            } else {
                target
            };
            debug!(target: "extract", "  ✓ {}", target.display());
            used.insert(target.clone());
            files.push(target);
        }

        Ok(ExtractionSummary {
            file_count: files.len(),
            files,
        })
    }
}

/// 每个路径段都清理成安全的文件名。
fn sanitize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                clean.push(safe_fs_name(&part.to_string_lossy(), NAME_MAX_LEN));
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

/// `path` 已被占用时在文件名后追加 `_N`。
fn unused_path(path: PathBuf, used: &HashSet<PathBuf>) -> PathBuf {
    if !used.contains(&path) {
        return path;
    }
    let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut n = 1;
    loop {
        let candidate = dir.join(format!("{stem}_{n}{ext}"));
        if !used.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn is_document(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| DOCUMENT_EXTENSIONS.iter().any(|d| e.eq_ignore_ascii_case(d)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DocumentNaming {
    date: String,
    title: String,
}

impl DocumentNaming {
    /// 日期取自压缩包文件名，取不到时用当天；标题取文件名去掉日期后的部分。
    fn for_archive(archive: &Path) -> Self {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = archive
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let found = re_dates().iter().find_map(|re| {
            let caps = re.captures(&name)?;
            let date = caps.get(1)?.as_str()[..8].to_string();
            let whole = caps.get(0)?.as_str().to_string();
            is_valid_date(&date).then_some((date, whole))
        });
        let (date, matched) = match found {
            Some((date, matched)) => (date, Some(matched)),
            None => (today(), None),
        };

        let mut title = stem.clone();
        if let Some(matched) = matched {
            title = title.replacen(&matched, "", 1);
        }
        let mut title: String = title
            .trim_matches(|c: char| c == '_' || c == '-' || c.is_whitespace())
            .replace('.', "_")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if title.is_empty() {
            title = stem.replace('.', "_");
        }
        Self {
            date,
            title: safe_fs_name(&title, NAME_MAX_LEN),
        }
    }

    /// 本次解压已占用的名字加 `_N` 后缀；之前运行留下的同名文件直接覆盖。
    fn rename(&self, file: &Path, used: &HashSet<PathBuf>) -> io::Result<PathBuf> {
        let dir = file.parent().unwrap_or_else(|| Path::new("."));
        let ext = file
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let base = format!("{}{}", self.date, self.title);

        let mut candidate = dir.join(format!("{base}.{ext}"));
        let mut n = 1;
        while used.contains(&candidate) {
            candidate = dir.join(format!("{base}_{n}.{ext}"));
            n += 1;
        }
        if candidate != file {
            if candidate.exists() {
                fs::remove_file(&candidate)?;
            }
            fs::rename(file, &candidate)?;
            debug!(
                target: "extract",
                "重命名：{} -> {}",
                file.display(),
                candidate.display()
            );
        }
        Ok(candidate)
    }
}

fn is_valid_date(raw: &str) -> bool {
    Date::parse(raw, format_description!("[year][month][day]")).is_ok()
}

fn today() -> String {
    let d = OffsetDateTime::now_utc().date();
    format!("{:04}{:02}{:02}", d.year(), u8::from(d.month()), d.day())
}
