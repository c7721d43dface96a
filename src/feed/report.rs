//! Processing-report handling: decompress the downloaded result artifact and
//! parse it into one summary shape, whether the marketplace returned JSON or
//! the older XML processing report.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::io::Read;
use tracing::warn;

/// Outcome counts extracted from a result artifact. Partial acceptance is
/// still a terminal success for the batch; these counts are reporting data.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportSummary {
    pub processed: i64,
    pub accepted: i64,
    pub invalid: i64,
    pub errors: i64,
    pub warnings: i64,
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Turn a downloaded artifact into text. Gzip is detected by magic bytes;
/// anything else, including a payload that merely looks compressed but does
/// not decode, is treated as already-decompressed text rather than an error.
pub fn decode_artifact(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(bytes);
        let mut text = String::new();
        match decoder.read_to_string(&mut text) {
            Ok(_) => return text,
            Err(err) => {
                warn!(?err, "gzip signature present but decompression failed; using raw payload");
            }
        }
    }
    String::from_utf8_lossy(bytes).into_owned()
}

#[derive(Deserialize)]
struct JsonReport {
    #[serde(default)]
    summary: JsonSummary,
}

#[derive(Deserialize, Default)]
struct JsonSummary {
    #[serde(rename = "messagesProcessed", default)]
    processed: i64,
    #[serde(rename = "messagesAccepted", default)]
    accepted: i64,
    #[serde(rename = "messagesInvalid", default)]
    invalid: i64,
    #[serde(default)]
    errors: i64,
    #[serde(default)]
    warnings: i64,
}

#[derive(Deserialize)]
struct XmlReport {
    #[serde(rename = "ProcessingSummary")]
    summary: XmlSummary,
}

#[derive(Deserialize)]
struct XmlSummary {
    #[serde(rename = "MessagesProcessed", default)]
    processed: i64,
    #[serde(rename = "MessagesAccepted", default)]
    accepted: i64,
    #[serde(rename = "MessagesInvalid", default)]
    invalid: i64,
    #[serde(rename = "MessagesWithError", default)]
    errors: i64,
    #[serde(rename = "MessagesWithWarning", default)]
    warnings: i64,
}

/// Parse a decoded result artifact. Payloads opening with a JSON delimiter
/// are parsed as the JSON report schema, everything else as the XML
/// processing report.
pub fn parse_report(text: &str) -> Result<ReportSummary> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        let report: JsonReport =
            serde_json::from_str(trimmed).context("result artifact is not valid report JSON")?;
        Ok(ReportSummary {
            processed: report.summary.processed,
            accepted: report.summary.accepted,
            invalid: report.summary.invalid,
            errors: report.summary.errors,
            warnings: report.summary.warnings,
        })
    } else {
        let report: XmlReport =
            quick_xml::de::from_str(trimmed).context("result artifact is not a processing report")?;
        Ok(ReportSummary {
            processed: report.summary.processed,
            accepted: report.summary.accepted,
            invalid: report.summary.invalid,
            errors: report.summary.errors,
            warnings: report.summary.warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const JSON_REPORT: &str = r#"{
        "header": {"sellerId": "SELLER", "version": "2.0"},
        "summary": {
            "messagesProcessed": 10,
            "messagesAccepted": 8,
            "messagesInvalid": 2,
            "errors": 2,
            "warnings": 1
        }
    }"#;

    const XML_REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
        <ProcessingReport>
            <ProcessingSummary>
                <MessagesProcessed>10</MessagesProcessed>
                <MessagesAccepted>8</MessagesAccepted>
                <MessagesInvalid>2</MessagesInvalid>
                <MessagesWithError>2</MessagesWithError>
                <MessagesWithWarning>1</MessagesWithWarning>
            </ProcessingSummary>
        </ProcessingReport>"#;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn gzipped_json_report_parses() {
        let text = decode_artifact(&gzip(JSON_REPORT.as_bytes()));
        let summary = parse_report(&text).unwrap();
        assert_eq!(summary.processed, 10);
        assert_eq!(summary.accepted, 8);
        assert_eq!(summary.invalid, 2);
    }

    #[test]
    fn xml_report_yields_identical_counts() {
        let json = parse_report(JSON_REPORT).unwrap();
        let xml = parse_report(XML_REPORT).unwrap();
        assert_eq!(json, xml);
    }

    #[test]
    fn plain_payload_passes_through_decode() {
        assert_eq!(decode_artifact(b"{\"summary\":{}}"), "{\"summary\":{}}");
    }

    #[test]
    fn missing_summary_defaults_to_zero() {
        let summary = parse_report(r#"{"header": {}}"#).unwrap();
        assert_eq!(summary, ReportSummary::default());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_report("definitely not a report").is_err());
    }
}
