//! Sub-task names: `{subtask_type}_{system_prompt_id}_{user_prompt_id}_{YYYYmmdd_HHMMSS}`.
//!
//! Names have one-second resolution. Two names generated in the same second
//! for the same file and prompts are equal; callers persisting a sub-task
//! treat that as an update of the existing entry.

use std::time::{SystemTime, UNIX_EPOCH};

use time::OffsetDateTime;
use time::macros::format_description;

use crate::models::{ArtifactFile, SubTaskKind};

const UNKNOWN_PROMPT: &str = "unknown";

/// Prompt configuration a sub-task name is derived from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileInfo<'a> {
    pub system_prompt_id: Option<&'a str>,
    pub user_prompt_id: Option<&'a str>,
}

impl<'a> From<&'a ArtifactFile> for FileInfo<'a> {
    fn from(file: &'a ArtifactFile) -> Self {
        Self {
            system_prompt_id: file.system_prompt_id.as_deref(),
            user_prompt_id: file.user_prompt_id.as_deref(),
        }
    }
}

pub fn generate_subtask_name<'a>(kind: SubTaskKind, file_info: impl Into<FileInfo<'a>>) -> String {
    subtask_name_at(kind, file_info, SystemTime::now())
}

pub fn subtask_name_at<'a>(
    kind: SubTaskKind,
    file_info: impl Into<FileInfo<'a>>,
    at: SystemTime,
) -> String {
    let info = file_info.into();
    format!(
        "{}_{}_{}_{}",
        kind.as_str(),
        prompt_or_unknown(info.system_prompt_id),
        prompt_or_unknown(info.user_prompt_id),
        name_timestamp(at)
    )
}

/// Recovers the sub-task type from a generated name.
pub fn parse_subtask_kind(name: &str) -> Option<SubTaskKind> {
    // shorts_creation must be tested before any shorter prefix could match.
    let mut kinds = SubTaskKind::ALL;
    kinds.sort_by_key(|kind| std::cmp::Reverse(kind.as_str().len()));
    kinds.into_iter().find(|kind| {
        name.strip_prefix(kind.as_str())
            .is_some_and(|rest| rest.starts_with('_'))
    })
}

fn prompt_or_unknown(value: Option<&str>) -> &str {
    match value.map(str::trim) {
        Some(value) if !value.is_empty() => value,
        _ => UNKNOWN_PROMPT,
    }
}

fn name_timestamp(at: SystemTime) -> String {
    let utc = OffsetDateTime::from(at);
    utc.format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))
    .unwrap_or_else(|_| {
        let seconds = at
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        seconds.to_string()
    })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::{FileInfo, generate_subtask_name, parse_subtask_kind, subtask_name_at};
    use crate::models::{ArtifactFile, SubTaskKind};

    // 2025-01-01T00:00:00Z
    const NEW_YEAR_2025: u64 = 1_735_689_600;

    #[test]
    fn name_has_type_prompts_and_utc_timestamp() {
        let mut file = ArtifactFile::new("plans/ep1.json", UNIX_EPOCH);
        file.system_prompt_id = Some("P1".to_string());
        file.user_prompt_id = Some("P2".to_string());

        let name = subtask_name_at(
            SubTaskKind::Clipping,
            &file,
            UNIX_EPOCH + Duration::from_secs(NEW_YEAR_2025),
        );
        assert_eq!(name, "clipping_P1_P2_20250101_000000");
    }

    #[test]
    fn generated_name_uses_the_current_time() {
        let name = generate_subtask_name(
            SubTaskKind::ShortsCreation,
            FileInfo {
                system_prompt_id: Some("P1"),
                user_prompt_id: Some("P2"),
            },
        );

        let stamp = name
            .strip_prefix("shorts_creation_P1_P2_")
            .expect("type and prompt ids lead the name");
        let (date, clock) = stamp.split_once('_').expect("date and time are separated");
        assert_eq!(date.len(), 8);
        assert_eq!(clock.len(), 6);
        assert!(date.chars().chain(clock.chars()).all(|c| c.is_ascii_digit()));
        assert!(date >= "20250101");
        assert_eq!(parse_subtask_kind(&name), Some(SubTaskKind::ShortsCreation));
    }

    #[test]
    fn missing_prompts_render_as_unknown() {
        let name = subtask_name_at(
            SubTaskKind::Compilation,
            FileInfo {
                system_prompt_id: Some("sys"),
                user_prompt_id: Some("  "),
            },
            UNIX_EPOCH + Duration::from_secs(NEW_YEAR_2025 + 3_723),
        );
        assert_eq!(name, "compilation_sys_unknown_20250101_010203");
    }

    #[test]
    fn every_kind_starts_its_name_and_keeps_both_prompts() {
        for kind in SubTaskKind::ALL {
            for (system, user) in [("a", "b"), ("sys-7", "user_9"), ("x", "x")] {
                let name = subtask_name_at(
                    kind,
                    FileInfo {
                        system_prompt_id: Some(system),
                        user_prompt_id: Some(user),
                    },
                    UNIX_EPOCH + Duration::from_secs(NEW_YEAR_2025),
                );
                assert!(name.starts_with(kind.as_str()));
                assert!(name.contains(system));
                assert!(name.contains(user));
                assert_eq!(parse_subtask_kind(&name), Some(kind));
            }
        }
    }

    #[test]
    fn same_second_names_collide() {
        let info = FileInfo {
            system_prompt_id: Some("P1"),
            user_prompt_id: Some("P2"),
        };
        let at = UNIX_EPOCH + Duration::from_secs(NEW_YEAR_2025);
        assert_eq!(
            subtask_name_at(SubTaskKind::ShortsCreation, info, at),
            subtask_name_at(
                SubTaskKind::ShortsCreation,
                info,
                at + Duration::from_millis(900)
            )
        );
    }

    #[test]
    fn unrelated_names_have_no_kind() {
        assert_eq!(parse_subtask_kind("clippingP1"), None);
        assert_eq!(parse_subtask_kind("render_P1_P2_20250101_000000"), None);
    }
}
