//! TAP request parameters

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Parameter names the core recognizes (matched case-insensitively)
pub const STANDARD_NAMES: &[&str] = &[
    "REQUEST",
    "LANG",
    "VERSION",
    "FORMAT",
    "MAXREC",
    "QUERY",
    "UPLOAD",
    "PHASE",
    "WAIT",
    "ACTION",
    "EXECUTIONDURATION",
    "DESTRUCTION",
];

/// Source of an uploaded table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadSource {
    /// Fetch the table body from this URI
    Uri(String),

    /// The table body arrived inline as a multipart file part
    Inline(Vec<u8>),
}

/// One uploaded-table descriptor from the UPLOAD parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadDef {
    /// Table name within the job's upload namespace
    pub name: String,

    pub source: UploadSource,
}

/// Everything decoded from one HTTP request body/query string:
/// name/value pairs in arrival order plus multipart file parts
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    pairs: Vec<(String, String)>,
    files: Vec<(String, Vec<u8>)>,
}

impl RequestParams {
    pub fn new(pairs: Vec<(String, String)>, files: Vec<(String, Vec<u8>)>) -> Self {
        Self { pairs, files }
    }

    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self {
            pairs,
            files: Vec::new(),
        }
    }

    /// Last value for a name, compared case-insensitively
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for a name, in arrival order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn file(&self, part_name: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(part_name))
            .map(|(_, body)| body.as_slice())
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Build the job parameters, resolving UPLOAD descriptors
    pub fn to_tap_params(&self, uploads_enabled: bool) -> Result<TapParams, Error> {
        let mut params = TapParams {
            request: self.get("REQUEST").map(String::from),
            lang: self.get("LANG").map(String::from),
            version: self.get("VERSION").map(String::from),
            format: self.get("FORMAT").map(String::from),
            max_rec: None,
            query: self.get("QUERY").map(String::from),
            uploads: Vec::new(),
            extra: Vec::new(),
        };

        if let Some(raw) = self.get("MAXREC") {
            let value: i64 = raw
                .trim()
                .parse()
                .map_err(|_| Error::validation(format!("MAXREC is not an integer: {}", raw)))?;
            if value < -1 {
                return Err(Error::validation(format!(
                    "MAXREC must be -1 (unlimited) or non-negative, got {}",
                    value
                )));
            }
            params.max_rec = Some(value);
        }

        for raw in self.get_all("UPLOAD") {
            let defs = parse_upload_value(raw, self, uploads_enabled)?;
            params.uploads.extend(defs);
        }

        // Unrecognized names are kept verbatim
        for (name, value) in &self.pairs {
            if !STANDARD_NAMES
                .iter()
                .any(|std| name.eq_ignore_ascii_case(std))
            {
                params.extra.push((name.clone(), value.clone()));
            }
        }

        Ok(params)
    }
}

/// Parse one UPLOAD parameter value: `name,uri` pairs separated by `;`
fn parse_upload_value(
    raw: &str,
    request: &RequestParams,
    uploads_enabled: bool,
) -> Result<Vec<UploadDef>, Error> {
    let mut defs = Vec::new();
    for pair in raw.split(';').filter(|p| !p.trim().is_empty()) {
        let (name, uri) = pair
            .split_once(',')
            .ok_or_else(|| Error::validation(format!("UPLOAD entry is not a name,uri pair: {}", pair)))?;
        let name = name.trim();
        let uri = uri.trim();

        if !is_valid_table_name(name) {
            return Err(Error::validation(format!(
                "Invalid uploaded table name: {}",
                name
            )));
        }
        if uri.is_empty() {
            return Err(Error::validation(format!(
                "Missing URI for uploaded table {}",
                name
            )));
        }
        if !uploads_enabled {
            return Err(Error::validation(
                "Table uploads are disabled on this service".to_string(),
            ));
        }

        let source = if let Some(part) = uri.strip_prefix("param:") {
            let body = request.file(part).ok_or_else(|| {
                Error::validation(format!("No file part named {} in the request", part))
            })?;
            UploadSource::Inline(body.to_vec())
        } else {
            UploadSource::Uri(uri.to_string())
        };

        defs.push(UploadDef {
            name: name.to_string(),
            source,
        });
    }
    Ok(defs)
}

/// Uploaded table names become SQL identifiers and must stay plain
fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Typed job parameters, plus verbatim extras and upload descriptors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TapParams {
    pub request: Option<String>,
    pub lang: Option<String>,
    pub version: Option<String>,
    pub format: Option<String>,
    pub max_rec: Option<i64>,
    pub query: Option<String>,
    pub uploads: Vec<UploadDef>,
    pub extra: Vec<(String, String)>,
}

impl TapParams {
    /// Effective row cap, folding the client's MAXREC into the service
    /// limits; `None` means unlimited
    pub fn effective_max_rec(&self, service_max: i64, service_default: i64) -> Option<i64> {
        let requested = self.max_rec.unwrap_or(service_default);
        match (requested, service_max) {
            (-1, -1) => None,
            (-1, max) => Some(max),
            (req, -1) => Some(req),
            (req, max) => Some(req.min(max)),
        }
    }

    /// Named parameter lookup used by the `/parameters/{name}` endpoint
    pub fn lookup(&self, name: &str) -> Option<String> {
        match name.to_ascii_uppercase().as_str() {
            "REQUEST" => self.request.clone(),
            "LANG" => self.lang.clone(),
            "VERSION" => self.version.clone(),
            "FORMAT" => self.format.clone(),
            "MAXREC" => self.max_rec.map(|v| v.to_string()),
            "QUERY" => self.query.clone(),
            _ => self
                .extra
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone()),
        }
    }

    /// Apply a single write from the `/parameters` endpoint
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), Error> {
        match name.to_ascii_uppercase().as_str() {
            "REQUEST" => self.request = Some(value.to_string()),
            "LANG" => self.lang = Some(value.to_string()),
            "VERSION" => self.version = Some(value.to_string()),
            "FORMAT" => self.format = Some(value.to_string()),
            "QUERY" => self.query = Some(value.to_string()),
            "MAXREC" => {
                let parsed: i64 = value
                    .trim()
                    .parse()
                    .map_err(|_| Error::validation(format!("MAXREC is not an integer: {}", value)))?;
                if parsed < -1 {
                    return Err(Error::validation("MAXREC must be -1 or non-negative"));
                }
                self.max_rec = Some(parsed);
            }
            "UPLOAD" => {
                return Err(Error::validation(
                    "UPLOAD can only be set at job creation".to_string(),
                ))
            }
            _ => {
                if let Some(slot) = self
                    .extra
                    .iter_mut()
                    .find(|(n, _)| n.eq_ignore_ascii_case(name))
                {
                    slot.1 = value.to_string();
                } else {
                    self.extra.push((name.to_string(), value.to_string()));
                }
            }
        }
        Ok(())
    }
}
