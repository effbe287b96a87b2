//! The single seam between the pipeline and where samples come from: a local
//! block database or a remote read endpoint, selected by the source
//! descriptor's URL scheme.

use std::{
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use timeseries::{
    matchers::matches_all,
    Matcher,
    Series,
};
use tsdb::Db;
use url::Url;

use remote_read::{
    LabelValuesClient,
    ReadClient,
};

/// A drained-once stream of series for one query window.
pub type SeriesCursor = Box<dyn Iterator<Item = anyhow::Result<Series>> + Send>;

/// Capability set of a sample source. `label_values` is only exercised when
/// tenant-splitting; local sources answer it from their indexes, remote
/// sources need the label API side channel.
#[async_trait]
pub trait Source: Send + Sync {
    /// Series matching `matchers` with samples in `[mint, maxt]`, inclusive.
    async fn querier(
        &self,
        mint: i64,
        maxt: i64,
        matchers: &[Matcher],
    ) -> anyhow::Result<SeriesCursor>;

    async fn label_values(
        &self,
        name: &str,
        mint: i64,
        maxt: i64,
        matchers: &[Matcher],
    ) -> anyhow::Result<Vec<String>>;

    /// The widest interval the source can serve. Remote endpoints do not
    /// advertise bounds and return the saturating extremes.
    async fn time_bounds(&self) -> anyhow::Result<(i64, i64)>;
}

/// `http://` / `https://` descriptors name a remote source; anything else is
/// a local block database directory.
pub fn is_remote(descriptor: &str) -> bool {
    descriptor.starts_with("http://") || descriptor.starts_with("https://")
}

pub fn open_source(
    descriptor: &str,
    label_api: Option<Url>,
    timeout: Duration,
) -> anyhow::Result<Arc<dyn Source>> {
    if is_remote(descriptor) {
        let endpoint = Url::parse(descriptor)
            .with_context(|| format!("parsing remote read url {descriptor}"))?;
        Ok(Arc::new(RemoteSource::new(endpoint, label_api, timeout)?))
    } else {
        Ok(Arc::new(LocalSource::new(PathBuf::from(descriptor))))
    }
}

/// Reads from an on-disk block database. Each query opens its own read-only
/// view so concurrent windows never share block state.
pub struct LocalSource {
    dir: PathBuf,
}

impl LocalSource {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl Source for LocalSource {
    async fn querier(
        &self,
        mint: i64,
        maxt: i64,
        matchers: &[Matcher],
    ) -> anyhow::Result<SeriesCursor> {
        let dir = self.dir.clone();
        let matchers = matchers.to_vec();
        let cursor = tokio::task::spawn_blocking(move || -> anyhow::Result<SeriesCursor> {
            let db = Db::open_read_only(&dir)?;
            let merged = db.querier(mint, maxt)?;
            Ok(Box::new(merged.filter(move |series| match series {
                Ok(series) => matches_all(&matchers, &series.labels),
                Err(_) => true,
            })))
        })
        .await
        .context("local querier task")??;
        Ok(cursor)
    }

    async fn label_values(
        &self,
        name: &str,
        mint: i64,
        maxt: i64,
        matchers: &[Matcher],
    ) -> anyhow::Result<Vec<String>> {
        let cursor = self.querier(mint, maxt, matchers).await?;
        let name = name.to_owned();
        let mut values: Vec<String> = Vec::new();
        for series in cursor {
            let series = series?;
            if let Some(value) = series.labels.get(&name) {
                if !value.is_empty() {
                    values.push(value.to_owned());
                }
            }
        }
        values.sort();
        values.dedup();
        Ok(values)
    }

    async fn time_bounds(&self) -> anyhow::Result<(i64, i64)> {
        let dir = self.dir.clone();
        let bounds = tokio::task::spawn_blocking(move || -> anyhow::Result<(i64, i64)> {
            let db = Db::open_read_only(&dir)?;
            db.time_bounds()
                .with_context(|| format!("source database {} has no blocks", dir.display()))
        })
        .await
        .context("time bounds task")??;
        Ok(bounds)
    }
}

/// Reads from a remote read endpoint, one request per query window.
pub struct RemoteSource {
    client: ReadClient,
    label_client: Option<LabelValuesClient>,
}

impl RemoteSource {
    pub fn new(
        endpoint: Url,
        label_api: Option<Url>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = ReadClient::new(endpoint, timeout)?;
        let label_client = label_api
            .map(|api| LabelValuesClient::new(api, timeout))
            .transpose()?;
        Ok(Self {
            client,
            label_client,
        })
    }
}

#[async_trait]
impl Source for RemoteSource {
    async fn querier(
        &self,
        mint: i64,
        maxt: i64,
        matchers: &[Matcher],
    ) -> anyhow::Result<SeriesCursor> {
        let series = self.client.read(mint, maxt, matchers).await?;
        Ok(Box::new(series.into_iter().map(Ok)))
    }

    async fn label_values(
        &self,
        name: &str,
        mint: i64,
        maxt: i64,
        matchers: &[Matcher],
    ) -> anyhow::Result<Vec<String>> {
        let client = self
            .label_client
            .as_ref()
            .context("tenant-splitting a remote source requires --label-api")?;
        client.label_values(name, mint, maxt, matchers).await
    }

    async fn time_bounds(&self) -> anyhow::Result<(i64, i64)> {
        Ok((i64::MIN, i64::MAX))
    }
}
