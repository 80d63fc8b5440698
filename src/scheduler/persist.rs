use super::task::Task;
use super::ScheduleError;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

fn persist_err(path: &Path) -> impl FnOnce(std::io::Error) -> ScheduleError + '_ {
    move |source| ScheduleError::Persist {
        path: path.to_path_buf(),
        source,
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Writes the whole map as pretty JSON through a temp file and a rename, so a
/// crash never leaves a truncated schedule behind.
pub(crate) async fn write_schedule(
    path: &Path,
    tasks: &BTreeMap<String, Task>,
) -> Result<(), ScheduleError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).await.map_err(persist_err(path))?;
    }

    let data = serde_json::to_vec_pretty(tasks).map_err(|e| persist_err(path)(e.into()))?;
    let tmp = temp_path(path);
    fs::write(&tmp, &data).await.map_err(persist_err(path))?;
    fs::rename(&tmp, path).await.map_err(persist_err(path))?;

    debug!("Write {} tasks to {}", tasks.len(), path.display());
    Ok(())
}

/// Reads a schedule file. Keys are taken as task names. Entries that do not
/// parse or validate are skipped with a warning so one bad task does not
/// discard the rest.
pub(crate) async fn read_schedule(path: &Path) -> Result<BTreeMap<String, Task>, ScheduleError> {
    let data = fs::read(path).await.map_err(persist_err(path))?;
    let raw: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(&data).map_err(|e| persist_err(path)(e.into()))?;

    let mut tasks = BTreeMap::new();
    for (name, value) in raw {
        let mut task: Task = match serde_json::from_value(value) {
            Ok(t) => t,
            Err(e) => {
                warn!("Skip task {} in {}: {}", name, path.display(), e);
                continue;
            }
        };
        if task.name != name {
            debug!("Task {} stored under key {}, use key", task.name, name);
            task.name = name.clone();
        }
        if let Err(e) = task.validate() {
            warn!("Skip {} in {}", e, path.display());
            continue;
        }
        tasks.insert(name, task);
    }
    Ok(tasks)
}

/// Moves an unreadable schedule file out of the way so the next write does
/// not replace it. Returns where it went.
pub(crate) async fn set_aside(path: &Path) -> Result<PathBuf, ScheduleError> {
    let mut target = OsString::from(path.as_os_str());
    target.push(".broken");
    let target = PathBuf::from(target);
    fs::rename(path, &target).await.map_err(persist_err(path))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::TestType;
    use crate::scheduler::task::Interval;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn creates_parent_dirs_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/schedule.json");
        let when = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let mut tasks = BTreeMap::new();
        let task = Task::test("nightly", TestType::Download, when).every(Interval::Daily);
        tasks.insert(task.name.clone(), task);

        write_schedule(&path, &tasks).await.unwrap();
        assert!(path.exists());
        assert!(!temp_path(&path).exists());
        assert_eq!(read_schedule(&path).await.unwrap(), tasks);
    }

    #[tokio::test]
    async fn unreadable_files_are_persist_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            read_schedule(&missing).await,
            Err(ScheduleError::Persist { .. })
        ));

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, b"{ not json").unwrap();
        assert!(matches!(
            read_schedule(&garbage).await,
            Err(ScheduleError::Persist { .. })
        ));
    }

    #[tokio::test]
    async fn bad_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        std::fs::write(
            &path,
            br#"{
                "good": {"name": "good", "test_type": "icmp",
                         "datetime": "2024-01-01T00:00:00Z", "recurring": false,
                         "active": true, "created_on": "2024-01-01T00:00:00Z"},
                "unknown-type": {"name": "unknown-type", "test_type": "smoke",
                         "datetime": "2024-01-01T00:00:00Z", "recurring": false,
                         "active": true, "created_on": "2024-01-01T00:00:00Z"},
                "no-interval": {"name": "no-interval", "test_type": "tcp",
                         "datetime": "2024-01-01T00:00:00Z", "recurring": true,
                         "active": true, "created_on": "2024-01-01T00:00:00Z"},
                "no-action": {"name": "no-action",
                         "datetime": "2024-01-01T00:00:00Z", "recurring": false,
                         "active": true, "created_on": "2024-01-01T00:00:00Z"}
            }"#,
        )
        .unwrap();

        let tasks = read_schedule(&path).await.unwrap();
        assert_eq!(tasks.keys().collect::<Vec<_>>(), vec!["good"]);
        assert_eq!(tasks["good"].test_type, Some(TestType::Icmp));
    }

    #[tokio::test]
    async fn set_aside_keeps_the_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let moved = set_aside(&path).await.unwrap();
        assert!(!path.exists());
        assert_eq!(std::fs::read(&moved).unwrap(), b"{ not json");
    }
}
