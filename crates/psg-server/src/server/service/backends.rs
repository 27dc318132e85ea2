//! Processor registration over the in-memory backends.

use crate::server::config::ServerConfig;
use anyhow::Context;
use bytes::Bytes;
use psg_core::{
    backend::{
        LookupCache,
        memory::{Delivery, Fixture},
    },
    cache::ExcludeBlobCache,
    dispatcher::Dispatcher,
    loop_binder::LoopBinder,
    processors::{
        cass::{CassFactory, CassServices},
        cdd::CddFactory,
        dummy::DummyFactory,
        osg::{OsgCaller, OsgFactory, OsgServices, memory::MemoryOsgPool},
        snp::SnpFactory,
        wgs::{WgsFactory, WgsServices},
    },
};
use std::{path::Path, sync::Arc};

/// A populated dispatcher plus the caches the server maintains.
pub struct Backends {
    pub dispatcher: Dispatcher,
    pub exclude: Arc<ExcludeBlobCache>,
}

/// Reads the JSON data file, or starts empty without one.
pub fn load_fixture(path: Option<&Path>) -> anyhow::Result<Fixture> {
    let Some(path) = path else {
        return Ok(Fixture::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read fixture {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("malformed fixture {}", path.display()))
}

/// Registers every processor in priority order: Cassandra, OSG, CDD, SNP,
/// WGS and the catch-all.
///
/// Blobs of the OSG satellites and bioseqs under the OSG namespaces are also
/// loaded into the in-process OSG server.
pub fn build(
    config: &ServerConfig,
    fixture: Fixture,
    delivery: Delivery,
    binder: Option<Arc<LoopBinder>>,
) -> Backends {
    let settings = Arc::new(config.settings());
    let osg_pool = osg_pool(config, &fixture);
    let backends = fixture.into_backends(delivery);

    let cass = Arc::new(CassServices::new(
        backends.blobs,
        backends.bioseqs,
        Some(backends.cache as Arc<dyn LookupCache>),
        Arc::clone(&settings),
    ));

    let mut dispatcher = Dispatcher::new();
    for factory in CassFactory::all(&cass) {
        dispatcher.add_processor(factory);
    }
    dispatcher.add_processor(Arc::new(OsgFactory::new(Arc::new(OsgServices {
        caller: OsgCaller::new(Arc::new(osg_pool), settings.osg.retry_count),
        binder: binder.clone(),
        settings: Arc::clone(&settings),
    }))));
    dispatcher.add_processor(Arc::new(CddFactory::new(backends.cdd)));
    dispatcher.add_processor(Arc::new(SnpFactory::new(backends.snp)));
    dispatcher.add_processor(Arc::new(WgsFactory::new(Arc::new(WgsServices {
        client: backends.wgs,
        binder,
    }))));
    dispatcher.add_processor(Arc::new(DummyFactory::new(settings.enable_dummy)));

    Backends {
        dispatcher,
        exclude: Arc::clone(&cass.exclude),
    }
}

fn osg_pool(config: &ServerConfig, fixture: &Fixture) -> MemoryOsgPool {
    let pool = MemoryOsgPool::new(config.osg_pool_size);
    for blob in fixture.blobs.iter().filter(|b| config.osg_sats.contains(&b.sat)) {
        let chunks = blob.chunks.iter().cloned().map(Bytes::from).collect();
        pool.insert_blob(blob.sat, blob.record.clone(), chunks);
    }
    for info in &fixture.bioseqs {
        if config
            .osg_namespaces
            .iter()
            .any(|ns| info.accession.starts_with(ns.as_str()))
        {
            pool.insert_bioseq(info.clone());
        }
    }
    pool
}
