//! Interface to the external reference converter.
//!
//! The converter itself is a black box: options are set by name, `execute`
//! returns an immediate status code, and a non-zero code ends the request.
//! A zero code means the job is running; [`convert_blocking`] then polls
//! [`ConversionService::finished`] with exponential backoff until it reports
//! completion or the timeout passes.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

pub const OPTION_INPUT_FORMAT:  &str = "INPUT_FORMAT";
pub const OPTION_OUTPUT_FORMAT: &str = "OUTPUT_FORMAT";
pub const OPTION_INPUT_FILE:    &str = "INPUT_FILE";
pub const OPTION_OUTPUT_FILE:   &str = "OUTPUT_FILE";

/// Status codes returned by `execute`, plus the conditions the driver
/// detects itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("converter internal failure (code -1)")]
    Internal,
    #[error("no input file specified")]
    NoInputFile,
    #[error("no output file specified")]
    NoOutputFile,
    #[error("no output format specified")]
    NoOutputFormat,
    #[error("licensed output option given without a voucher")]
    VoucherMissing,
    #[error("cannot read the input format")]
    UnreadableInputFormat,
    #[error("cannot write the output format")]
    UnwritableOutputFormat,
    #[error("client is not attached to the converter")]
    NotAttached,
    #[error("extraction requested but the input has the wrong type")]
    ExtractionWrongType,
    #[error("extraction failed")]
    ExtractionFailed,
    #[error("decryption requested but the input has the wrong type")]
    DecryptionWrongType,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("voucher is invalid for this input")]
    InvalidVoucher,
    #[error("no licence exists for this input")]
    NoLicence,
    #[error("input file is the same as the output file")]
    InputIsOutput,
    #[error("unknown converter status code {0}")]
    Unknown(i32),
    #[error("conversion did not finish within {0:?}")]
    Timeout(Duration),
    #[error("path must be absolute: {0}")]
    RelativePath(PathBuf),
}

impl ServiceError {
    /// Map an `execute` status code; `0` (running) maps to `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => return None,
            -1 => ServiceError::Internal,
            1 => ServiceError::NoInputFile,
            2 => ServiceError::NoOutputFile,
            3 => ServiceError::NoOutputFormat,
            4 => ServiceError::VoucherMissing,
            5 => ServiceError::UnreadableInputFormat,
            6 => ServiceError::UnwritableOutputFormat,
            7 => ServiceError::NotAttached,
            8 => ServiceError::ExtractionWrongType,
            9 => ServiceError::ExtractionFailed,
            10 => ServiceError::DecryptionWrongType,
            11 => ServiceError::DecryptionFailed,
            12 => ServiceError::InvalidVoucher,
            13 => ServiceError::NoLicence,
            14 => ServiceError::InputIsOutput,
            other => ServiceError::Unknown(other),
        })
    }

    pub fn code(&self) -> Option<i32> {
        Some(match self {
            ServiceError::Internal => -1,
            ServiceError::NoInputFile => 1,
            ServiceError::NoOutputFile => 2,
            ServiceError::NoOutputFormat => 3,
            ServiceError::VoucherMissing => 4,
            ServiceError::UnreadableInputFormat => 5,
            ServiceError::UnwritableOutputFormat => 6,
            ServiceError::NotAttached => 7,
            ServiceError::ExtractionWrongType => 8,
            ServiceError::ExtractionFailed => 9,
            ServiceError::DecryptionWrongType => 10,
            ServiceError::DecryptionFailed => 11,
            ServiceError::InvalidVoucher => 12,
            ServiceError::NoLicence => 13,
            ServiceError::InputIsOutput => 14,
            ServiceError::Unknown(c) => *c,
            ServiceError::Timeout(_) | ServiceError::RelativePath(_) => return None,
        })
    }
}

/// The converter as seen by this crate.
pub trait ConversionService {
    fn set_option(&mut self, name: &str, value: &str);
    /// Start the job; `0` means running, anything else is a status code.
    fn execute(&mut self) -> i32;
    fn finished(&mut self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub input:         PathBuf,
    pub output:        PathBuf,
    pub input_format:  String,
    pub output_format: String,
}

impl ConversionRequest {
    pub fn to_stl(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input:         input.into(),
            output:        output.into(),
            input_format:  "3Shape".into(),
            output_format: "STL".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial: Duration,
    pub max:     Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max:     Duration::from_secs(2),
            timeout: Duration::from_secs(600),
        }
    }
}

fn absolute(p: &Path) -> Result<&str, ServiceError> {
    if !p.is_absolute() {
        return Err(ServiceError::RelativePath(p.to_path_buf()));
    }
    p.to_str().ok_or_else(|| ServiceError::RelativePath(p.to_path_buf()))
}

/// Run one conversion to completion.  Returns the time spent.
pub fn convert_blocking<S: ConversionService + ?Sized>(
    service: &mut S,
    request: &ConversionRequest,
    policy:  PollPolicy,
) -> Result<Duration, ServiceError> {
    let input = absolute(&request.input)?;
    let output = absolute(&request.output)?;
    service.set_option(OPTION_INPUT_FORMAT, &request.input_format);
    service.set_option(OPTION_OUTPUT_FORMAT, &request.output_format);
    service.set_option(OPTION_INPUT_FILE, input);
    service.set_option(OPTION_OUTPUT_FILE, output);

    let started = Instant::now();
    if let Some(err) = ServiceError::from_code(service.execute()) {
        return Err(err);
    }

    let mut delay = policy.initial;
    while !service.finished() {
        let waited = started.elapsed();
        if waited >= policy.timeout {
            return Err(ServiceError::Timeout(waited));
        }
        debug!(?delay, "conversion running");
        thread::sleep(delay.min(policy.timeout - waited));
        delay = (delay * 2).min(policy.max);
    }
    let took = started.elapsed();
    info!(input, output, ?took, "conversion finished");
    Ok(took)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Scripted {
        code:          i32,
        polls_to_done: Option<usize>,
        polls:         usize,
        options:       HashMap<String, String>,
    }

    impl Scripted {
        fn new(code: i32, polls_to_done: Option<usize>) -> Self {
            Self { code, polls_to_done, polls: 0, options: HashMap::new() }
        }
    }

    impl ConversionService for Scripted {
        fn set_option(&mut self, name: &str, value: &str) {
            self.options.insert(name.to_string(), value.to_string());
        }

        fn execute(&mut self) -> i32 {
            self.code
        }

        fn finished(&mut self) -> bool {
            self.polls += 1;
            self.polls_to_done.map_or(false, |n| self.polls > n)
        }
    }

    fn fast() -> PollPolicy {
        PollPolicy {
            initial: Duration::from_millis(1),
            max:     Duration::from_millis(2),
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn codes_round_trip() {
        for code in (-1..=14).filter(|&c| c != 0) {
            let err = ServiceError::from_code(code).unwrap();
            assert_eq!(err.code(), Some(code));
            assert!(!matches!(err, ServiceError::Unknown(_)));
        }
        assert_eq!(ServiceError::from_code(0), None);
        assert_eq!(ServiceError::from_code(99), Some(ServiceError::Unknown(99)));
    }

    #[test]
    fn polls_until_finished() {
        let mut svc = Scripted::new(0, Some(3));
        let req = ConversionRequest::to_stl("/in/a.dcm", "/out/a.stl");
        convert_blocking(&mut svc, &req, fast()).unwrap();
        assert_eq!(svc.polls, 4);
        assert_eq!(svc.options[OPTION_INPUT_FILE], "/in/a.dcm");
        assert_eq!(svc.options[OPTION_OUTPUT_FORMAT], "STL");
    }

    #[test]
    fn immediate_code_is_returned() {
        let mut svc = Scripted::new(14, None);
        let req = ConversionRequest::to_stl("/in/a.dcm", "/in/a.dcm");
        assert_eq!(convert_blocking(&mut svc, &req, fast()), Err(ServiceError::InputIsOutput));
        assert_eq!(svc.polls, 0);
    }

    #[test]
    fn never_finishing_job_times_out() {
        let mut svc = Scripted::new(0, None);
        let req = ConversionRequest::to_stl("/in/a.dcm", "/out/a.stl");
        assert!(matches!(convert_blocking(&mut svc, &req, fast()), Err(ServiceError::Timeout(_))));
    }

    #[test]
    fn relative_paths_are_refused() {
        let mut svc = Scripted::new(0, Some(0));
        let req = ConversionRequest::to_stl("a.dcm", "/out/a.stl");
        assert!(matches!(convert_blocking(&mut svc, &req, fast()), Err(ServiceError::RelativePath(_))));
        assert!(svc.options.is_empty());
    }
}
