use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::Settings;
use crate::dictionary::Dictionary;
use crate::error::EngineResult;
use crate::extract::{ParsedPrice, PriceExtractor, PriceParseResult};
use crate::model::HospitalInput;
use crate::scoring::angles::MatchTarget;
use crate::scoring::profile::{build_profile, HospitalProfile, ProfileWeights};
use crate::scoring::{record_product_score, score_product, ProductMatchScore, ScoringChangeHistory, ScoringCriteria};
use crate::signals::{classify_signals, SalesSignal, SalesSignalRule};
use crate::snapshot::{ChangeDetector, CrawlSnapshot, EquipmentChange};
use crate::store::{EngineStore, LogAndContinue};

pub struct Engine {
    pub dictionary: Dictionary,
    pub rules: Vec<SalesSignalRule>,
    pub products: Vec<(String, ScoringCriteria)>,
    pub weights: ProfileWeights,
}

#[derive(Debug, Clone)]
pub struct HospitalEvaluation {
    pub hospital_id: i64,
    pub is_first_crawl: bool,
    /// Stripped text changed, so the page warrants OCR / LLM re-analysis.
    /// Prices are re-parsed on every crawl regardless.
    pub reanalyzed: bool,
    pub snapshot: CrawlSnapshot,
    /// Lines with a won amount that no pattern understood.
    pub unparsed: Vec<String>,
    pub changes: Vec<EquipmentChange>,
    pub signals: Vec<SalesSignal>,
    pub profile: HospitalProfile,
    pub scores: Vec<ProductMatchScore>,
    pub grade_changes: Vec<ScoringChangeHistory>,
}

impl Engine {
    pub fn new(
        dictionary: Dictionary,
        rules: Vec<SalesSignalRule>,
        products: Vec<(String, ScoringCriteria)>,
        weights: ProfileWeights,
    ) -> EngineResult<Self> {
        weights.validate()?;
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self {
            dictionary,
            rules,
            products,
            weights,
        })
    }

    pub fn from_settings(settings: &Settings) -> EngineResult<Self> {
        Self::new(
            settings.dictionary()?,
            settings.rules()?,
            settings.criteria()?,
            settings.profile_weights,
        )
    }

    fn extract_prices(&self, input: &HospitalInput, now: DateTime<Utc>) -> PriceParseResult {
        let extractor = PriceExtractor::new(&self.dictionary).with_reference_date(now.date_naive());
        let text = match input.ocr_text.as_deref() {
            Some(ocr) => format!("{}\n{}", input.raw_text, ocr),
            None => input.raw_text.clone(),
        };
        let mut result = extractor.parse_prices(&text);
        let structured: Vec<ParsedPrice> = extractor
            .prices_from_treatments(&input.treatments)
            .into_iter()
            .filter(|p| {
                !result
                    .prices
                    .iter()
                    .any(|q| q.total_price == p.total_price && q.standard_name == p.standard_name)
            })
            .collect();
        result.prices.extend(structured);
        result
    }

    /// Run every stage for one hospital.
    ///
    /// Only the previous-snapshot read and the snapshot write can fail the
    /// evaluation; every other write is best-effort.
    pub fn evaluate_hospital(
        &self,
        store: &dyn EngineStore,
        input: &HospitalInput,
        now: DateTime<Utc>,
    ) -> Result<HospitalEvaluation> {
        let hospital_id = input.hospital_id;
        let equipment = input.equipment_names();
        let treatments = input.treatment_names();
        let detector = ChangeDetector::new(&self.dictionary);

        let detection = detector.detect_changes(
            store,
            hospital_id,
            &input.raw_text,
            input.ocr_text.as_deref(),
            &equipment,
            &treatments,
        )?;

        if !detection.should_run_ocr {
            debug!(hospital_id, "stripped text unchanged, OCR not warranted");
        }
        let parsed = self.extract_prices(input, now);
        store
            .insert_prices(hospital_id, now, &parsed.prices)
            .log_and_continue("saving parsed prices");

        let mut snapshot =
            detector.build_snapshot(&detection, input.crawl_tier, &equipment, &treatments, parsed.prices, now);
        let snapshot_id = detector
            .save_snapshot(store, &mut snapshot)
            .with_context(|| format!("hospital {}", hospital_id))?;

        let changes = detector.detect_equipment_changes(
            store,
            hospital_id,
            detection.previous.as_ref(),
            Some(snapshot_id),
            &equipment,
            &treatments,
            now,
        );

        let signals: Vec<SalesSignal> = self
            .products
            .iter()
            .flat_map(|(product_id, _)| classify_signals(store, hospital_id, &changes, product_id, &self.rules))
            .collect();

        let profile = build_profile(input, &self.dictionary, &self.weights, now);
        store
            .upsert_profile(&profile)
            .log_and_continue("saving hospital profile");

        let target = MatchTarget::from_input(input, &self.dictionary);
        let mut scores = Vec::with_capacity(self.products.len());
        let mut grade_changes = Vec::new();
        for (product_id, criteria) in &self.products {
            let score = score_product(product_id, criteria, &target, input, now);
            grade_changes.extend(record_product_score(store, &score));
            scores.push(score);
        }

        info!(
            hospital_id,
            first = detection.is_first_crawl,
            reanalyzed = detection.should_run_ocr,
            prices = snapshot.pricing.len(),
            changes = changes.len(),
            signals = signals.len(),
            profile = profile.profile_score,
            grade_changes = grade_changes.len(),
            "hospital evaluated"
        );

        Ok(HospitalEvaluation {
            hospital_id,
            is_first_crawl: detection.is_first_crawl,
            reanalyzed: detection.should_run_ocr,
            snapshot,
            unparsed: parsed.unparsed,
            changes,
            signals,
            profile,
            scores,
            grade_changes,
        })
    }
}
