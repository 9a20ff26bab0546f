//! The messages exchanged with the worker process.
//!
//! Each message is a single line of JSON.

use std::path::PathBuf;

use crate::{
    errors::{AllocationError, LOCAL_FAILURE},
    Method, Scalar,
};

/// The allocation request sent to the worker.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Request {
    /// The job identifier, echoed back in the reply.
    pub job: u64,
    /// The allocation method to use.
    pub method: Method,
    /// The file to allocate the disk space for.
    pub path: PathBuf,
    /// The offset to allocate at.
    pub offset: Scalar,
    /// The amount of bytes to allocate.
    pub length: Scalar,
    /// The mode flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Scalar>,
}

/// The reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Reply {
    /// The job identifier of the request.
    pub job: u64,
    /// The path of the request.
    pub path: PathBuf,
    /// The failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The raw error number of the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
}

impl Reply {
    /// A successful reply.
    pub fn success(job: u64, path: PathBuf) -> Self {
        Self {
            job,
            path,
            error: None,
            errno: None,
        }
    }

    /// A failure reply.
    pub fn failure(job: u64, path: PathBuf, err: &AllocationError) -> Self {
        Self {
            job,
            path,
            error: Some(err.message.clone()),
            errno: Some(err.errno),
        }
    }

    /// Whether the reply reports a failure.
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.errno.map_or(false, |errno| errno != 0)
    }

    /// Turn the reply into the outcome it reports.
    pub fn into_result(self) -> Result<PathBuf, AllocationError> {
        if !self.is_failure() {
            return Ok(self.path);
        }
        let Self { error, errno, .. } = self;
        Err(AllocationError::new(
            errno.unwrap_or(LOCAL_FAILURE),
            error.unwrap_or_default(),
        ))
    }
}

/// Encode the message as a newline-terminated line.
pub fn encode<T: serde::Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_layout() {
        let request = Request {
            job: 3,
            method: Method::PosixFallocate,
            path: "data.bin".into(),
            offset: 0.into(),
            length: 4096.into(),
            mode: None,
        };
        let line = encode(&request).unwrap();
        assert_eq!(
            std::str::from_utf8(&line).unwrap(),
            "{\"job\":3,\"method\":\"posix_fallocate\",\"path\":\"data.bin\",\"offset\":0,\"length\":4096}\n"
        );
    }

    #[test]
    fn request_ignores_unknown_fields() {
        let request: Request = serde_json::from_str(
            r#"{"job":1,"method":"fallocate","path":"f","offset":0,"length":1.09,"mode":0,"extra":true}"#,
        )
        .unwrap();
        assert_eq!(request.job, 1);
        assert_eq!(request.length, Scalar::Float(1.09));
        assert_eq!(request.mode, Some(Scalar::Integer(0)));
    }

    #[test]
    fn success_reply() {
        let reply: Reply = serde_json::from_str(r#"{"job":7,"path":"f"}"#).unwrap();
        assert_eq!(reply, Reply::success(7, "f".into()));
        assert_eq!(reply.into_result().unwrap(), PathBuf::from("f"));
    }

    #[test]
    fn failure_reply() {
        let err = AllocationError::local("Invalid length");
        let reply = Reply::failure(9, "f".into(), &err);
        let line = encode(&reply).unwrap();
        assert_eq!(
            std::str::from_utf8(&line).unwrap(),
            "{\"job\":9,\"path\":\"f\",\"error\":\"Invalid length\",\"errno\":-1}\n"
        );

        let decoded: Reply = serde_json::from_slice(&line).unwrap();
        assert_eq!(decoded.into_result().unwrap_err(), err);
    }

    #[test]
    fn errno_alone_is_a_failure() {
        let reply: Reply = serde_json::from_str(r#"{"job":1,"path":"f","errno":28}"#).unwrap();
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.errno, 28);
        assert_eq!(err.message, "");
    }

    #[test]
    fn error_without_errno_is_local() {
        let reply: Reply = serde_json::from_str(r#"{"job":1,"path":"f","error":"boom"}"#).unwrap();
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.errno, -1);
        assert_eq!(err.code, "EGENERIC");
        assert_eq!(err.to_string(), "boom (-1, EGENERIC)");
    }
}
