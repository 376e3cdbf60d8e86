//! Read session, the full read and annotate flow of one run

use std::path::PathBuf;

use crate::{
    addressing::{AddressingPlan, PlanConfig},
    aggregator::{CollectSettings, ResponseOutcome, send_and_collect},
    annotate::{AnnotateError, AnnotatedCsv, TemplateStore},
    bus::CanBus,
    config::ReaderConfig,
    uds::{DataIdentifier, ReadDataByIdentifierMatcher, make_request},
};

/// Result of reading one identifier with one addressing plan
#[derive(Debug)]
pub struct ReadReport {
    /// Addressing plan used
    pub plan: PlanConfig,
    /// Identifier requested
    pub did: DataIdentifier,
    /// What the bus delivered
    pub outcome: ResponseOutcome,
    /// What was written to the result directory
    pub annotation: Result<AnnotatedCsv, AnnotateError>,
}

/// Result of a whole run
#[derive(Debug)]
pub struct RunReport {
    /// One entry per (plan, DID), in the order they were read
    pub reads: Vec<ReadReport>,
    /// Documentation copy made at the end of the run
    pub readme: Result<PathBuf, AnnotateError>,
}

impl RunReport {
    /// Number of reads that produced a positive response
    pub fn received(&self) -> usize {
        self.reads
            .iter()
            .filter(|r| matches!(r.outcome, ResponseOutcome::Received(_)))
            .count()
    }
}

/// Reads identifiers over a shared bus and annotates their templates
#[derive(Debug)]
pub struct ReadSession<'bus> {
    bus: &'bus CanBus,
    store: TemplateStore,
    settings: CollectSettings,
    readme: String,
}

impl<'bus> ReadSession<'bus> {
    /// Creates a session from the reader configuration
    pub fn new(bus: &'bus CanBus, config: &ReaderConfig) -> Self {
        Self {
            bus,
            store: TemplateStore::new(
                config.templates.format_dir.clone(),
                config.templates.result_dir.clone(),
            ),
            settings: config.collect_settings(),
            readme: config.templates.readme.clone(),
        }
    }

    /// Reads one identifier and annotates its template
    pub fn read(&self, plan_cfg: &PlanConfig, did: DataIdentifier) -> ReadReport {
        log::info!("Reading data id 0x{did:04x} with {}", plan_cfg.describe());
        let plan = AddressingPlan::build(plan_cfg);
        let outcome = send_and_collect(
            self.bus,
            &plan,
            &make_request(did),
            &ReadDataByIdentifierMatcher::new(did),
            &self.settings,
        );
        match &outcome {
            ResponseOutcome::Received(p) => log::info!("{} bytes of data received", p.len()),
            ResponseOutcome::TimedOut => log::info!("No data was received"),
            ResponseOutcome::TransportError(e) => log::error!("Read of 0x{did:04x} failed: {e}"),
        }
        let annotation = self.store.annotate(&outcome, did);
        match &annotation {
            Ok(csv) => log::info!("Wrote {}", csv.path.display()),
            Err(e) => log::warn!("{e}"),
        }
        ReadReport {
            plan: plan_cfg.clone(),
            did,
            outcome,
            annotation,
        }
    }

    /// Reads every identifier with every plan, in order, then copies the README.
    /// No unit of work is retried and no failure stops the ones after it
    pub fn run(&self, plans: &[PlanConfig], dids: &[DataIdentifier]) -> RunReport {
        let reads = plans
            .iter()
            .flat_map(|plan| dids.iter().map(move |did| (plan, *did)))
            .map(|(plan, did)| self.read(plan, did))
            .collect();
        let readme = self.store.copy_readme(&self.readme);
        if let Err(e) = &readme {
            log::warn!("{e}");
        }
        RunReport { reads, readme }
    }
}
