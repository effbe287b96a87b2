use std::time::Duration;

use anyhow::Context;
use prost::Message;
use serde::Deserialize;
use timeseries::{
    Labels,
    MatchType,
    Matcher,
    Sample,
    Series,
};
use url::Url;

use crate::protos;

/// Remote endpoints can serve arbitrarily wide windows; give them an hour
/// before declaring the read dead.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3600);

const REMOTE_READ_VERSION: &str = "0.1.0";

/// One remote read request per query window, sampled responses only.
pub struct ReadClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl ReadClient {
    pub fn new(endpoint: Url, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building remote read client")?;
        Ok(Self { http, endpoint })
    }

    /// Reads every series matching `matchers` with samples in
    /// `[mint_ms, maxt_ms]` (inclusive, per the wire protocol).
    pub async fn read(
        &self,
        mint_ms: i64,
        maxt_ms: i64,
        matchers: &[Matcher],
    ) -> anyhow::Result<Vec<Series>> {
        let request = protos::ReadRequest {
            queries: vec![protos::Query {
                start_timestamp_ms: mint_ms,
                end_timestamp_ms: maxt_ms,
                matchers: matchers.iter().map(to_proto_matcher).collect(),
            }],
            accepted_response_types: vec![protos::read_request::ResponseType::Samples as i32],
        };
        let body = snap::raw::Encoder::new()
            .compress_vec(&request.encode_to_vec())
            .context("compressing read request")?;

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/x-protobuf")
            .header(reqwest::header::CONTENT_ENCODING, "snappy")
            .header("X-Prometheus-Remote-Read-Version", REMOTE_READ_VERSION)
            .body(body)
            .send()
            .await
            .with_context(|| format!("remote read request to {}", self.endpoint))?
            .error_for_status()
            .context("remote read request rejected")?;

        let raw = response.bytes().await.context("reading response body")?;
        let decompressed = snap::raw::Decoder::new()
            .decompress_vec(&raw)
            .context("decompressing read response")?;
        let decoded = protos::ReadResponse::decode(decompressed.as_slice())
            .context("decoding read response")?;

        let result = decoded
            .results
            .into_iter()
            .next()
            .context("read response carried no results")?;
        tracing::debug!(
            "remote read [{mint_ms}, {maxt_ms}] returned {} series",
            result.timeseries.len(),
        );
        Ok(result.timeseries.into_iter().map(from_proto_series).collect())
    }
}

fn to_proto_matcher(matcher: &Matcher) -> protos::LabelMatcher {
    let match_type = match matcher.match_type {
        MatchType::Equal => protos::label_matcher::Type::Eq,
        MatchType::NotEqual => protos::label_matcher::Type::Neq,
        MatchType::Regexp => protos::label_matcher::Type::Re,
        MatchType::NotRegexp => protos::label_matcher::Type::Nre,
    };
    protos::LabelMatcher {
        r#type: match_type as i32,
        name: matcher.name.clone(),
        value: matcher.value.clone(),
    }
}

fn from_proto_series(ts: protos::TimeSeries) -> Series {
    let labels = Labels::from_pairs(ts.labels.into_iter().map(|l| (l.name, l.value)));
    let samples = ts
        .samples
        .into_iter()
        .map(|s| Sample::new(s.timestamp, s.value))
        .collect();
    Series::new(labels, samples)
}

#[derive(Deserialize)]
struct LabelValuesResponse {
    status: String,
    data: Vec<String>,
}

/// The label-values side channel, e.g. a Prometheus
/// `/api/v1/label` base URL. Only consulted when tenant-splitting a remote
/// source.
pub struct LabelValuesClient {
    http: reqwest::Client,
    base: Url,
}

impl LabelValuesClient {
    pub fn new(mut base: Url, timeout: Duration) -> anyhow::Result<Self> {
        // Keep a trailing slash so joining `<name>/values` appends instead of
        // replacing the last path segment.
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building label values client")?;
        Ok(Self { http, base })
    }

    /// `GET <base>/<name>/values?start=<s>&end=<s>&match[]=…` with epoch
    /// seconds bounds, one selector per matcher.
    pub async fn label_values(
        &self,
        name: &str,
        mint_ms: i64,
        maxt_ms: i64,
        matchers: &[Matcher],
    ) -> anyhow::Result<Vec<String>> {
        let url = self
            .base
            .join(&format!("{}/values", name))
            .with_context(|| format!("building label values url for {name}"))?;
        let mut request = self.http.get(url.clone()).query(&[
            ("start", (mint_ms / 1000).to_string()),
            ("end", (maxt_ms / 1000).to_string()),
        ]);
        for matcher in matchers {
            request = request.query(&[("match[]", format!("{{{matcher}}}"))]);
        }
        let response: LabelValuesResponse = request
            .send()
            .await
            .with_context(|| format!("label values request to {url}"))?
            .error_for_status()
            .context("label values request rejected")?
            .json()
            .await
            .context("decoding label values response")?;
        anyhow::ensure!(
            response.status == "success",
            "label values request returned status {}",
            response.status,
        );
        Ok(response.data)
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;
    use timeseries::{
        MatchType,
        Matcher,
    };

    use super::{
        from_proto_series,
        to_proto_matcher,
    };
    use crate::protos;

    #[test]
    fn test_matcher_type_mapping() -> anyhow::Result<()> {
        for (match_type, wire) in [
            (MatchType::Equal, protos::label_matcher::Type::Eq),
            (MatchType::NotEqual, protos::label_matcher::Type::Neq),
            (MatchType::Regexp, protos::label_matcher::Type::Re),
            (MatchType::NotRegexp, protos::label_matcher::Type::Nre),
        ] {
            let m = Matcher::new(match_type, "job", "node.*")?;
            assert_eq!(to_proto_matcher(&m).r#type, wire as i32);
        }
        Ok(())
    }

    #[test]
    fn test_request_snappy_roundtrip() -> anyhow::Result<()> {
        let request = protos::ReadRequest {
            queries: vec![protos::Query {
                start_timestamp_ms: 0,
                end_timestamp_ms: 3_599_999,
                matchers: vec![to_proto_matcher(&Matcher::new(
                    MatchType::Equal,
                    "__name__",
                    "up",
                )?)],
            }],
            accepted_response_types: vec![protos::read_request::ResponseType::Samples as i32],
        };
        let compressed = snap::raw::Encoder::new().compress_vec(&request.encode_to_vec())?;
        let decompressed = snap::raw::Decoder::new().decompress_vec(&compressed)?;
        assert_eq!(protos::ReadRequest::decode(decompressed.as_slice())?, request);
        Ok(())
    }

    #[test]
    fn test_series_conversion_sorts_labels() {
        let ts = protos::TimeSeries {
            labels: vec![
                protos::Label {
                    name: "job".into(),
                    value: "node".into(),
                },
                protos::Label {
                    name: "__name__".into(),
                    value: "up".into(),
                },
            ],
            samples: vec![protos::Sample {
                value: 1.0,
                timestamp: 1_000,
            }],
        };
        let series = from_proto_series(ts);
        assert_eq!(series.labels.iter().next().unwrap().name, "__name__");
        assert_eq!(series.samples.len(), 1);
    }
}
