//! Decides where a claimed task resumes from its status and the checkpoints
//! that still exist.

use std::path::Path;

use submit_core::{Task, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Extract,
    Prepare,
    Analyze,
    Publish,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Prepare => "prepare",
            Stage::Analyze => "analyze",
            Stage::Publish => "publish",
        }
    }

    /// Status written when the stage starts.
    pub fn status(self) -> TaskStatus {
        match self {
            Stage::Download => TaskStatus::Downloading,
            Stage::Extract => TaskStatus::Extracting,
            Stage::Prepare => TaskStatus::Preparing,
            Stage::Analyze => TaskStatus::Analyzing,
            Stage::Publish => TaskStatus::Uploading,
        }
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Download => Some(Stage::Extract),
            Stage::Extract => Some(Stage::Prepare),
            Stage::Prepare => Some(Stage::Analyze),
            Stage::Analyze => Some(Stage::Publish),
            Stage::Publish => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which checkpoints of a task can be trusted right now. A path checkpoint
/// counts only while the file or directory it names exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Artifacts {
    pub download: bool,
    pub extract: bool,
    pub prepared: bool,
    pub metadata: bool,
}

fn exists_on_disk(path: Option<&str>) -> bool {
    path.is_some_and(|p| !p.is_empty() && Path::new(p).exists())
}

impl Artifacts {
    pub fn probe(task: &Task) -> Self {
        Self {
            download: exists_on_disk(task.download_path.as_deref()),
            extract: exists_on_disk(task.extract_path.as_deref()),
            prepared: exists_on_disk(task.prepared_path.as_deref()),
            metadata: task.metadata.is_some(),
        }
    }

    /// Whether every input `stage` consumes is present.
    pub fn ready_for(&self, stage: Stage) -> bool {
        match stage {
            Stage::Download => true,
            Stage::Extract => self.download,
            Stage::Prepare | Stage::Analyze => self.extract,
            Stage::Publish => self.prepared && self.metadata,
        }
    }

    fn first_missing(&self) -> Stage {
        if !self.download {
            Stage::Download
        } else if !self.extract {
            Stage::Extract
        } else if !self.prepared {
            Stage::Prepare
        } else if !self.metadata {
            Stage::Analyze
        } else {
            Stage::Publish
        }
    }
}

/// Stage a claimed task resumes at, or `None` for a finished task.
///
/// The status says how far the task got; the checkpoints say what survived.
/// When the chosen stage lacks an input, routing steps back to the earliest
/// stage that can rebuild it.
pub fn resume_stage(status: TaskStatus, artifacts: &Artifacts) -> Option<Stage> {
    let wanted = match status {
        TaskStatus::Created => artifacts.first_missing(),
        TaskStatus::Downloading if artifacts.download => Stage::Extract,
        TaskStatus::Downloading => Stage::Download,
        TaskStatus::Extracting if artifacts.extract => Stage::Prepare,
        TaskStatus::Extracting => Stage::Extract,
        TaskStatus::Preparing if artifacts.prepared => Stage::Analyze,
        TaskStatus::Preparing => Stage::Prepare,
        TaskStatus::Analyzing if artifacts.metadata => Stage::Publish,
        TaskStatus::Analyzing => Stage::Analyze,
        TaskStatus::Uploading | TaskStatus::FillingForm | TaskStatus::Publishing => {
            Stage::Publish
        }
        TaskStatus::Done | TaskStatus::Error => return None,
    };
    Some(fall_back(wanted, artifacts))
}

fn fall_back(mut stage: Stage, artifacts: &Artifacts) -> Stage {
    while !artifacts.ready_for(stage) {
        stage = match stage {
            Stage::Download => return Stage::Download,
            Stage::Extract => Stage::Download,
            Stage::Prepare | Stage::Analyze => Stage::Extract,
            Stage::Publish if !artifacts.prepared => Stage::Prepare,
            Stage::Publish => Stage::Analyze,
        };
    }
    stage
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: Artifacts = Artifacts {
        download: false,
        extract: false,
        prepared: false,
        metadata: false,
    };
    const ALL: Artifacts = Artifacts {
        download: true,
        extract: true,
        prepared: true,
        metadata: true,
    };

    #[test]
    fn fresh_task_downloads() {
        assert_eq!(resume_stage(TaskStatus::Created, &NONE), Some(Stage::Download));
    }

    #[test]
    fn created_with_checkpoints_skips_finished_work() {
        let a = Artifacts {
            prepared: false,
            metadata: false,
            ..ALL
        };
        assert_eq!(resume_stage(TaskStatus::Created, &a), Some(Stage::Prepare));
    }

    #[test]
    fn finished_checkpoint_moves_on() {
        assert_eq!(resume_stage(TaskStatus::Downloading, &ALL), Some(Stage::Extract));
        assert_eq!(resume_stage(TaskStatus::Extracting, &ALL), Some(Stage::Prepare));
        assert_eq!(resume_stage(TaskStatus::Preparing, &ALL), Some(Stage::Analyze));
        assert_eq!(resume_stage(TaskStatus::Analyzing, &ALL), Some(Stage::Publish));
    }

    #[test]
    fn missing_checkpoint_reruns_its_stage() {
        let a = Artifacts {
            extract: false,
            ..ALL
        };
        assert_eq!(resume_stage(TaskStatus::Extracting, &a), Some(Stage::Extract));
        let a = Artifacts {
            metadata: false,
            ..ALL
        };
        assert_eq!(resume_stage(TaskStatus::Analyzing, &a), Some(Stage::Analyze));
    }

    #[test]
    fn missing_input_falls_back_to_earliest_valid_stage() {
        assert_eq!(resume_stage(TaskStatus::Extracting, &NONE), Some(Stage::Download));
        let a = Artifacts {
            download: true,
            ..NONE
        };
        assert_eq!(resume_stage(TaskStatus::Preparing, &a), Some(Stage::Extract));
        let a = Artifacts {
            prepared: false,
            ..ALL
        };
        assert_eq!(resume_stage(TaskStatus::Publishing, &a), Some(Stage::Prepare));
    }

    #[test]
    fn remote_statuses_restart_publish() {
        for status in [
            TaskStatus::Uploading,
            TaskStatus::FillingForm,
            TaskStatus::Publishing,
        ] {
            assert_eq!(resume_stage(status, &ALL), Some(Stage::Publish));
        }
    }

    #[test]
    fn finished_tasks_do_not_route() {
        assert_eq!(resume_stage(TaskStatus::Done, &ALL), None);
        assert_eq!(resume_stage(TaskStatus::Error, &ALL), None);
    }

    #[test]
    fn probe_checks_the_filesystem() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("a.zip");
        std::fs::write(&archive, b"zip").unwrap();
        let mut task = crate::worker::tests::blank_task();
        task.download_path = Some(archive.display().to_string());
        task.extract_path = Some(tmp.path().join("gone").display().to_string());

        let a = Artifacts::probe(&task);
        assert!(a.download);
        assert!(!a.extract);
        assert!(!a.prepared);
        assert!(!a.metadata);
    }
}
