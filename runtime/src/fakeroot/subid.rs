//! Subordinate id databases (`/etc/subuid`, `/etc/subgid`).
//!
//! Each entry is `name-or-uid:start:count`; a leading `!` disables it and a
//! `#` starts a comment running to the end of the line. Every line an edit
//! does not touch is written back exactly as read.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use apptainer_core::error::{ApptainerError, Result};

use super::user::{SystemUserDb, UserDb, UserInfo};
use crate::fs::sibling_temp_path;
use crate::lock::FileLock;

/// Smallest usable range.
pub const MIN_RANGE: u32 = 65_536;

/// Highest start handed out by [`SubidConfig::add_user`].
pub const START_MAX: u32 = (1 << 31) - MIN_RANGE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubidEntry {
    /// User name or decimal uid, as written.
    pub owner: String,
    pub start: u32,
    pub count: u32,
    pub disabled: bool,
}

impl SubidEntry {
    pub fn is_valid(&self) -> bool {
        self.start >= 1 && self.count >= MIN_RANGE
    }

    pub fn matches(&self, user: &UserInfo) -> bool {
        self.owner == user.name || self.owner == user.uid.to_string()
    }

    fn overlaps(&self, start: u32, count: u32) -> bool {
        let (a0, a1) = (u64::from(self.start), u64::from(self.start) + u64::from(self.count));
        let (b0, b1) = (u64::from(start), u64::from(start) + u64::from(count));
        a0 < b1 && b0 < a1
    }

    /// Container ids 1.. onto this range; id 0 is the caller.
    pub fn mapping(&self) -> IdMapping {
        IdMapping {
            container_id: 1,
            host_id: self.start,
            size: self.count,
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let trimmed = line.split('#').next().unwrap_or_default().trim();
        if trimmed.is_empty() {
            return None;
        }
        let (disabled, body) = match trimmed.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let mut fields = body.split(':');
        let (Some(owner), Some(start), Some(count), None) = (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return None;
        };
        if owner.is_empty() {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            start: start.trim().parse().ok()?,
            count: count.trim().parse().ok()?,
            disabled,
        })
    }
}

impl fmt::Display for SubidEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.disabled {
            f.write_str("!")?;
        }
        write!(f, "{}:{}:{}", self.owner, self.start, self.count)
    }
}

/// One line of an id map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// Where ranges for a user come from.
pub trait SubidSource: Send + Sync {
    fn entries_for(&self, user: &UserInfo) -> Result<Vec<SubidEntry>>;
}

/// Pick the range a user maps onto: enabled, valid, largest count, and the
/// earliest such entry on a tie.
pub fn select_range(entries: &[SubidEntry], user: &UserInfo) -> Result<SubidEntry> {
    let mut best: Option<&SubidEntry> = None;
    for entry in entries.iter().filter(|e| e.matches(user) && !e.disabled && e.is_valid()) {
        if best.map(|b| entry.count > b.count).unwrap_or(true) {
            best = Some(entry);
        }
    }
    if let Some(entry) = best {
        return Ok(entry.clone());
    }
    let disabled = entries.iter().any(|e| e.matches(user) && e.disabled && e.is_valid());
    Err(ApptainerError::NoValidMapping(if disabled {
        format!("the fakeroot mapping of {} ({}) has been disabled by the administrator", user.name, user.uid)
    } else {
        format!("no valid mapping entry found for {} ({})", user.name, user.uid)
    }))
}

#[derive(Debug, Clone)]
enum Line {
    Entry { entry: SubidEntry, raw: String },
    Raw(String),
}

impl Line {
    fn entry(&self) -> Option<&SubidEntry> {
        match self {
            Line::Entry { entry, .. } => Some(entry),
            Line::Raw(_) => None,
        }
    }

    fn text(&self) -> &str {
        match self {
            Line::Entry { raw, .. } | Line::Raw(raw) => raw,
        }
    }
}

impl From<SubidEntry> for Line {
    fn from(entry: SubidEntry) -> Self {
        let raw = entry.to_string();
        Line::Entry { entry, raw }
    }
}

/// Render `entry` in place of the entry in `raw`, keeping its indentation
/// and any trailing comment.
fn rerender(raw: &str, entry: &SubidEntry) -> String {
    let indent = &raw[..raw.len() - raw.trim_start().len()];
    match raw.find('#') {
        Some(i) => {
            let gap = &raw[raw[..i].trim_end().len().max(indent.len())..i];
            format!("{}{}{}{}", indent, entry, gap, &raw[i..])
        }
        None => format!("{}{}", indent, entry),
    }
}

/// Lines of a database plus whether it ended with a newline.
#[derive(Debug, Clone)]
struct Contents {
    lines: Vec<Line>,
    trailing_newline: bool,
}

impl Contents {
    fn parse(path: &Path, content: &str) -> Self {
        if content.is_empty() {
            return Self {
                lines: Vec::new(),
                trailing_newline: true,
            };
        }
        let body = content.strip_suffix('\n');
        let lines = body
            .unwrap_or(content)
            .split('\n')
            .map(|line| match SubidEntry::parse(line) {
                Some(entry) => Line::Entry {
                    entry,
                    raw: line.to_string(),
                },
                None => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() && !trimmed.starts_with('#') {
                        tracing::debug!(path = %path.display(), line, "Keeping unparsable subid line");
                    }
                    Line::Raw(line.to_string())
                }
            })
            .collect();
        Self {
            lines,
            trailing_newline: body.is_some(),
        }
    }

    fn render(&self) -> String {
        let mut content = self.lines.iter().map(Line::text).collect::<Vec<_>>().join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            content.push('\n');
        }
        content
    }
}

/// A parsed subid database.
///
/// Opened with [`SubidConfig::open`] it holds an exclusive lock on
/// `<path>.lock` until dropped and may be edited; [`SubidConfig::load`]
/// gives a read-only snapshot.
pub struct SubidConfig {
    path: PathBuf,
    contents: Contents,
    users: Arc<dyn UserDb>,
    lock: Option<FileLock>,
}

impl fmt::Debug for SubidConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubidConfig")
            .field("path", &self.path)
            .field("lines", &self.contents.lines.len())
            .field("locked", &self.lock.is_some())
            .finish()
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "subid".to_string());
    path.with_file_name(format!("{}.lock", name))
}

fn read_contents(path: &Path) -> Result<Contents> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ApptainerError::PermissionDenied(format!("{}: {}", path.display(), e)))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Contents::parse(path, &content))
}

impl SubidConfig {
    /// Lock and load `path` for editing. A missing file is treated as empty
    /// and created on the first edit.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, Arc::new(SystemUserDb))
    }

    pub fn open_with(path: &Path, users: Arc<dyn UserDb>) -> Result<Self> {
        if path.as_os_str().is_empty() {
            return Err(ApptainerError::InvalidInput("empty subid database path".to_string()));
        }
        let lock = FileLock::exclusive(&lock_path(path))?;
        let contents = read_contents(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            contents,
            users,
            lock: Some(lock),
        })
    }

    /// Read-only snapshot; edits fail.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with(path, Arc::new(SystemUserDb))
    }

    pub fn load_with(path: &Path, users: Arc<dyn UserDb>) -> Result<Self> {
        if path.as_os_str().is_empty() {
            return Err(ApptainerError::InvalidInput("empty subid database path".to_string()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            contents: read_contents(path)?,
            users,
            lock: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> impl Iterator<Item = &SubidEntry> {
        self.contents.lines.iter().filter_map(Line::entry)
    }

    fn user_entries<'a>(&'a self, user: &'a UserInfo) -> impl Iterator<Item = &'a SubidEntry> + 'a {
        self.entries().filter(move |e| e.matches(user))
    }

    /// The entry for `username`, disabled or not. Entries with a zero
    /// start or a count below [`MIN_RANGE`] are ignored.
    pub fn user_entry(&self, username: &str) -> Result<SubidEntry> {
        let user = self.users.by_name(username)?;
        let mut best: Option<&SubidEntry> = None;
        for entry in self.user_entries(&user).filter(|e| e.is_valid()) {
            if best.map(|b| entry.count > b.count).unwrap_or(true) {
                best = Some(entry);
            }
        }
        best.cloned()
            .ok_or_else(|| ApptainerError::NotFound(format!("no valid mapping entry for user {}", username)))
    }

    /// The id mapping for the user with `uid`.
    pub fn get_range(&self, uid: u32) -> Result<IdMapping> {
        let user = self.users.by_uid(uid)?;
        let entries: Vec<SubidEntry> = self.user_entries(&user).cloned().collect();
        Ok(select_range(&entries, &user)?.mapping())
    }

    /// Allocate a new range for `username`, from the top of the id space
    /// down in [`MIN_RANGE`] steps.
    pub fn add_user(&mut self, username: &str) -> Result<SubidEntry> {
        let user = self.users.by_name(username)?;
        if self.user_entries(&user).next().is_some() {
            return Err(ApptainerError::Conflict(format!(
                "a mapping entry already exists for user {}",
                username
            )));
        }
        let start = self.free_slot().ok_or_else(|| {
            ApptainerError::RangeExhausted(format!("no free range of {} ids left in {}", MIN_RANGE, self.path.display()))
        })?;
        let entry = SubidEntry {
            owner: user.name.clone(),
            start,
            count: MIN_RANGE,
            disabled: false,
        };
        let added = entry.clone();
        self.mutate(move |lines| {
            lines.push(Line::from(entry));
            true
        })?;
        tracing::info!(path = %self.path.display(), user = username, start, "Added subid mapping");
        Ok(added)
    }

    /// Remove every entry of `username`.
    pub fn remove_user(&mut self, username: &str) -> Result<()> {
        let user = self.users.by_name(username)?;
        if self.user_entries(&user).next().is_none() {
            return Err(ApptainerError::NotFound(format!("no mapping entry for user {}", username)));
        }
        self.mutate(|lines| {
            lines.retain(|l| !l.entry().is_some_and(|e| e.matches(&user)));
            true
        })?;
        tracing::info!(path = %self.path.display(), user = username, "Removed subid mapping");
        Ok(())
    }

    pub fn enable_user(&mut self, username: &str) -> Result<()> {
        self.set_disabled(username, false)
    }

    pub fn disable_user(&mut self, username: &str) -> Result<()> {
        self.set_disabled(username, true)
    }

    fn set_disabled(&mut self, username: &str, disabled: bool) -> Result<()> {
        let user = self.users.by_name(username)?;
        if self.user_entries(&user).next().is_none() {
            return Err(ApptainerError::NotFound(format!("no mapping entry for user {}", username)));
        }
        self.mutate(|lines| {
            let mut changed = false;
            for line in lines.iter_mut() {
                if let Line::Entry { entry, raw } = line {
                    if entry.matches(&user) && entry.disabled != disabled {
                        entry.disabled = disabled;
                        *raw = rerender(raw, entry);
                        changed = true;
                    }
                }
            }
            changed
        })?;
        tracing::info!(
            path = %self.path.display(),
            user = username,
            disabled,
            "Updated subid mapping"
        );
        Ok(())
    }

    fn free_slot(&self) -> Option<u32> {
        let mut start = START_MAX;
        while start >= 1 {
            if !self.entries().any(|e| e.overlaps(start, MIN_RANGE)) {
                return Some(start);
            }
            start = start.checked_sub(MIN_RANGE)?;
        }
        None
    }

    /// Apply `edit` and persist the result. The in-memory lines are put back
    /// if writing fails; the file itself is only ever replaced whole.
    fn mutate<F>(&mut self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<Line>) -> bool,
    {
        if self.lock.is_none() {
            return Err(ApptainerError::InvalidInput(format!(
                "{} was opened read-only",
                self.path.display()
            )));
        }
        let before = self.contents.lines.clone();
        if !edit(&mut self.contents.lines) {
            return Ok(());
        }
        if let Err(e) = self.persist() {
            self.contents.lines = before;
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let content = self.contents.render();

        let mode = std::fs::metadata(&self.path)
            .map(|m| m.permissions().mode() & 0o7777)
            .unwrap_or(0o644);
        let staged = sibling_temp_path(&self.path, "new");
        let result = (|| -> std::io::Result<()> {
            let mut file: File = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode)
                .open(&staged)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&staged, &self.path)
        })();
        if let Err(e) = result {
            let _ = std::fs::remove_file(&staged);
            return Err(match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    ApptainerError::PermissionDenied(format!("{}: {}", self.path.display(), e))
                }
                _ => ApptainerError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("failed to write {}: {}", self.path.display(), e),
                )),
            });
        }
        Ok(())
    }
}

/// File-backed [`SubidSource`].
#[derive(Debug, Clone)]
pub struct FileSubidSource {
    path: PathBuf,
}

impl FileSubidSource {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl SubidSource for FileSubidSource {
    fn entries_for(&self, user: &UserInfo) -> Result<Vec<SubidEntry>> {
        let contents = read_contents(&self.path)?;
        Ok(contents
            .lines
            .into_iter()
            .filter_map(|l| match l {
                Line::Entry { entry, .. } if entry.matches(user) => Some(entry),
                _ => None,
            })
            .collect())
    }
}
