//! Query string decoding.
//!
//! Every route takes its arguments from the query string. Decoding either
//! yields a complete [`Request`] or an [`Error::InvalidRequest`] naming the
//! offending parameter; nothing half-parsed reaches the dispatcher.

use core::{fmt::Display, str::FromStr, time::Duration};
use psg_core::{
    Error, Result,
    protocol::OutputFormat,
    request::{
        AccVerHistoryRequest, AnnotRequest, BlobBySatSatKeyRequest, BlobBySeqIdRequest, BlobId,
        BlobOptions, CacheUsage, IncludeInfo, Request, RequestPayload, ResolveRequest,
        SeqIdQuery, TseChunkRequest, TseOption,
    },
};
use std::collections::HashMap;

/// Decoded `name=value` pairs. A repeated name keeps its last value.
#[derive(Debug, Default)]
pub struct Params(HashMap<String, String>);

impl Params {
    pub fn parse(query: Option<&str>) -> Self {
        let pairs = query
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        Self(pairs)
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    fn required(&self, name: &str) -> Result<&str> {
        match self.get(name) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(invalid(format!("missing required parameter '{name}'"))),
        }
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(name) {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| invalid(format!("bad value '{raw}' of '{name}': {e}"))),
        }
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool> {
        match self.get(name) {
            None | Some("") => Ok(default),
            Some("yes" | "true" | "1") => Ok(true),
            Some("no" | "false" | "0") => Ok(false),
            Some(raw) => Err(invalid(format!("'{name}' must be yes or no, got '{raw}'"))),
        }
    }

    fn list(&self, name: &str) -> Vec<&str> {
        self.get(name)
            .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }

    fn seq_id(&self) -> Result<SeqIdQuery> {
        Ok(SeqIdQuery {
            seq_id: self.required("seq_id")?.to_owned(),
            seq_id_type: self.parsed("seq_id_type")?,
        })
    }

    fn use_cache(&self) -> Result<CacheUsage> {
        Ok(self.parsed("use_cache")?.unwrap_or_default())
    }

    fn blob_options(&self, default_tse: TseOption) -> Result<BlobOptions> {
        let exclude_blobs = self
            .list("exclude_blobs")
            .into_iter()
            .map(BlobId::from_str)
            .collect::<Result<Vec<_>>>()?;
        Ok(BlobOptions {
            tse_option: self.parsed("tse")?.unwrap_or(default_tse),
            use_cache: self.use_cache()?,
            client_id: self.get("client_id").unwrap_or_default().to_owned(),
            send_blob_if_small: self.parsed("send_blob_if_small")?.unwrap_or(0),
            exclude_blobs,
            auto_blob_skipping: self.flag("auto_blob_skipping", true)?,
            last_modified: self.parsed("last_modified")?,
        })
    }

    /// Wraps `payload` with the request-level options: `trace`, `hops` and
    /// `timeout` (seconds).
    pub fn request(&self, payload: RequestPayload) -> Result<Request> {
        let mut request = Request::new(payload)
            .with_trace(self.flag("trace", false)?)
            .with_hops(self.parsed("hops")?.unwrap_or(0));
        if let Some(seconds) = self.parsed::<f64>("timeout")? {
            let timeout = Duration::try_from_secs_f64(seconds)
                .map_err(|e| invalid(format!("bad value '{seconds}' of 'timeout': {e}")))?;
            request = request.with_timeout(timeout);
        }
        Ok(request)
    }
}

fn invalid(reason: String) -> Error {
    Error::InvalidRequest { reason }
}

/// `/ID/resolve`
pub fn resolve(params: &Params) -> Result<RequestPayload> {
    let include = match params.get("include_info") {
        None | Some("") => IncludeInfo::default(),
        Some(raw) => IncludeInfo::from_names(raw.split(','))?,
    };
    Ok(RequestPayload::Resolve(ResolveRequest {
        seq_id: params.seq_id()?,
        include,
        output_format: params.parsed::<OutputFormat>("fmt")?.unwrap_or_default(),
        use_cache: params.use_cache()?,
    }))
}

/// `/ID/get`
pub fn get(params: &Params) -> Result<RequestPayload> {
    Ok(RequestPayload::BlobBySeqId(BlobBySeqIdRequest {
        seq_id: params.seq_id()?,
        options: params.blob_options(TseOption::Orig)?,
    }))
}

/// `/ID/getblob`
pub fn get_blob(params: &Params) -> Result<RequestPayload> {
    Ok(RequestPayload::BlobBySatSatKey(BlobBySatSatKeyRequest {
        blob_id: params.required("blob_id")?.parse()?,
        options: params.blob_options(TseOption::Orig)?,
    }))
}

/// `/ID/get_tse_chunk`
pub fn get_tse_chunk(params: &Params) -> Result<RequestPayload> {
    let id2_chunk = params
        .parsed::<i64>("id2_chunk")?
        .ok_or_else(|| invalid("missing required parameter 'id2_chunk'".into()))?;
    if id2_chunk < 0 {
        return Err(invalid(format!("'id2_chunk' must not be negative, got {id2_chunk}")));
    }
    Ok(RequestPayload::TseChunk(TseChunkRequest {
        id2_chunk,
        id2_info: params.required("id2_info")?.to_owned(),
        use_cache: params.use_cache()?,
    }))
}

/// `/ID/get_na`
pub fn get_na(params: &Params) -> Result<RequestPayload> {
    let names: Vec<String> = params.list("names").into_iter().map(str::to_owned).collect();
    if names.is_empty() {
        return Err(invalid("missing required parameter 'names'".into()));
    }
    Ok(RequestPayload::Annot(AnnotRequest {
        seq_id: params.seq_id()?,
        names,
        options: params.blob_options(TseOption::None)?,
    }))
}

/// `/ID/get_acc_ver_history`
pub fn get_acc_ver_history(params: &Params) -> Result<RequestPayload> {
    Ok(RequestPayload::AccVerHistory(AccVerHistoryRequest {
        seq_id: params.seq_id()?,
        use_cache: params.use_cache()?,
    }))
}
