use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::task::{ResultPayload, TaskValue, FLAG_GENERIC};

/// Encoded results larger than this travel as a spill file on shared storage
/// instead of inline bytes, keeping oversized results off the control
/// channel back to the controller.
pub const RESULT_INLINE_LIMIT: usize = 1024 * 1024;

/// Encode a computed value into a transmissible payload.
///
/// The fast native scheme is attempted first; values it cannot represent
/// fall back to the generic scheme, recorded in the payload flag. Values
/// neither scheme can encode are an error the caller converts into a task
/// failure. Oversized encodings are written to
/// `{workdir}/{task_id}.result`; the file is the controller's to read and
/// delete.
pub fn encode_result(task_id: Uuid, value: &TaskValue, workdir: &Path) -> Result<ResultPayload> {
    let (scheme, bytes) = match bincode::serialize(value) {
        Ok(bytes) => (0u8, bytes),
        Err(native) => match serde_json::to_vec(value) {
            Ok(bytes) => (FLAG_GENERIC, bytes),
            Err(generic) => return Err(AgentError::Unencodable { native, generic }),
        },
    };

    if bytes.len() > RESULT_INLINE_LIMIT {
        let path = spill_path(workdir, task_id);
        fs::write(&path, &bytes)?;
        tracing::debug!(task_id = %task_id, bytes = bytes.len(), path = %path.display(), "result spilled");
        Ok(ResultPayload::spilled(scheme, path))
    } else {
        Ok(ResultPayload::inline(scheme, bytes))
    }
}

/// Spill file location for a task. Derived from the task id, so concurrent
/// spills cannot collide.
pub fn spill_path(workdir: &Path, task_id: Uuid) -> PathBuf {
    workdir.join(format!("{task_id}.result"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ResultData;

    #[test]
    fn result_exactly_at_the_limit_stays_inline() {
        let dir = tempfile::tempdir().unwrap();
        // bincode prefixes a Text value with a 4-byte variant tag and an
        // 8-byte length; subtract them so the encoding lands exactly on the
        // limit.
        let text = "x".repeat(RESULT_INLINE_LIMIT - 12);
        let payload =
            encode_result(Uuid::new_v4(), &TaskValue::Text(text), dir.path()).unwrap();
        assert!(!payload.is_spilled());
        match &payload.data {
            ResultData::Inline(bytes) => assert_eq!(bytes.len(), RESULT_INLINE_LIMIT),
            other => panic!("expected inline payload, got {other:?}"),
        }
    }

    #[test]
    fn one_byte_over_the_limit_spills() {
        let dir = tempfile::tempdir().unwrap();
        let text = "x".repeat(RESULT_INLINE_LIMIT - 11);
        let payload =
            encode_result(Uuid::new_v4(), &TaskValue::Text(text), dir.path()).unwrap();
        assert!(payload.is_spilled());
    }

    #[test]
    fn spill_into_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let text = "x".repeat(RESULT_INLINE_LIMIT + 64);
        assert!(matches!(
            encode_result(Uuid::new_v4(), &TaskValue::Text(text), &missing),
            Err(AgentError::Io(_))
        ));
    }
}
