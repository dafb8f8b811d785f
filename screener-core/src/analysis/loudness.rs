use regex::Regex;
use serde::Serialize;

use crate::cache::MediaInput;
use crate::probe::MonoPairHint;

use super::{AnalysisError, AnalysisResult};

/// EBU R128 measurement over one window of the asset. Fields the filter
/// summary did not report come back absent, never synthesized.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoudnessWindow {
    pub start_time: f64,
    pub duration: f64,
    /// Integrated loudness, LUFS.
    pub integrated: Option<f64>,
    /// Loudness range, LU.
    pub range: Option<f64>,
    pub lra_low: Option<f64>,
    pub lra_high: Option<f64>,
    /// Integrated-loudness gating threshold, LUFS.
    pub threshold: Option<f64>,
}

pub(super) fn build_loudness_args(
    input: &MediaInput,
    pair: Option<&MonoPairHint>,
    start: f64,
    duration: f64,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-ss".into(),
        format!("{start:.3}"),
        "-t".into(),
        format!("{duration:.3}"),
        "-i".into(),
        input.as_arg(),
    ];
    match pair {
        Some(pair) => {
            args.push("-filter_complex".into());
            args.push(format!(
                "[0:a:{}][0:a:{}]amerge=inputs=2,ebur128=peak=true[aout]",
                pair.first, pair.second
            ));
            args.push("-map".into());
            args.push("[aout]".into());
        }
        None => {
            args.push("-map".into());
            args.push("0:a:0".into());
            args.push("-af".into());
            args.push("ebur128=peak=true".into());
        }
    }
    args.extend(["-f".into(), "null".into(), "-".into()]);
    args
}

/// Extract the final summary block the ebur128 filter prints on stderr:
///
/// ```text
///   Integrated loudness:
///     I:         -23.1 LUFS
///     Threshold: -33.5 LUFS
///
///   Loudness range:
///     LRA:         6.3 LU
///     Threshold: -43.5 LUFS
///     LRA low:   -28.1 LUFS
///     LRA high:  -21.8 LUFS
/// ```
pub(super) fn parse_summary(
    stderr: &str,
    start: f64,
    duration: f64,
) -> AnalysisResult<LoudnessWindow> {
    let summary_at = stderr
        .rfind("Summary:")
        .ok_or_else(|| AnalysisError::Parse("no ebur128 summary in output".into()))?;
    let summary = &stderr[summary_at..];

    let window = LoudnessWindow {
        start_time: start,
        duration,
        integrated: capture_lufs(summary, r"I:\s*(-?[\d.]+|nan)\s*LUFS"),
        range: capture_lufs(summary, r"LRA:\s*(-?[\d.]+|nan)\s*LU"),
        lra_low: capture_lufs(summary, r"LRA low:\s*(-?[\d.]+|nan)\s*LUFS"),
        lra_high: capture_lufs(summary, r"LRA high:\s*(-?[\d.]+|nan)\s*LUFS"),
        // Two thresholds appear; the integrated gate is the first.
        threshold: capture_lufs(summary, r"Threshold:\s*(-?[\d.]+|nan)\s*LUFS"),
    };
    Ok(window)
}

fn capture_lufs(summary: &str, pattern: &str) -> Option<f64> {
    let regex = Regex::new(pattern).ok()?;
    let value = regex.captures(summary)?.get(1)?.as_str().parse::<f64>().ok()?;
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SUMMARY: &str = r#"
[Parsed_ebur128_0 @ 0x55f] Summary:

  Integrated loudness:
    I:         -23.1 LUFS
    Threshold: -33.5 LUFS

  Loudness range:
    LRA:         6.3 LU
    Threshold: -43.5 LUFS
    LRA low:   -28.1 LUFS
    LRA high:  -21.8 LUFS

  True peak:
    Peak:       -2.3 dBFS
"#;

    #[test]
    fn parses_full_summary() {
        let window = parse_summary(SUMMARY, 0.0, 10.0).unwrap();
        assert_eq!(window.integrated, Some(-23.1));
        assert_eq!(window.range, Some(6.3));
        assert_eq!(window.lra_low, Some(-28.1));
        assert_eq!(window.lra_high, Some(-21.8));
        assert_eq!(window.threshold, Some(-33.5));
    }

    #[test]
    fn nan_fields_come_back_absent() {
        let stderr = r#"Summary:

  Integrated loudness:
    I:           nan LUFS
    Threshold:   nan LUFS

  Loudness range:
    LRA:         0.0 LU
"#;
        let window = parse_summary(stderr, 5.0, 10.0).unwrap();
        assert_eq!(window.integrated, None);
        assert_eq!(window.threshold, None);
        assert_eq!(window.range, Some(0.0));
        assert_eq!(window.lra_low, None);
    }

    #[test]
    fn missing_summary_is_an_error() {
        let err = parse_summary("frame log only, no final block", 0.0, 10.0).unwrap_err();
        assert!(matches!(err, AnalysisError::Parse(_)));
    }

    #[test]
    fn window_args_seek_and_merge() {
        let pair = MonoPairHint {
            first: 0,
            second: 1,
            stream_indices: (1, 2),
            compatible: true,
            title: "L + R (Stereo)".into(),
            language: None,
        };
        let args = build_loudness_args(
            &MediaInput::Local(PathBuf::from("/tmp/a.mov")),
            Some(&pair),
            30.0,
            10.0,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-ss 30.000"));
        assert!(joined.contains("-t 10.000"));
        assert!(joined.contains("amerge=inputs=2,ebur128=peak=true"));
        assert!(joined.ends_with("-f null -"));
    }

    #[test]
    fn window_args_standard_path() {
        let args = build_loudness_args(
            &MediaInput::Remote("https://signed".into()),
            None,
            0.0,
            10.0,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-map 0:a:0"));
        assert!(joined.contains("-af ebur128=peak=true"));
    }
}
