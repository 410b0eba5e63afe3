//! Result processing: confidence filter, label classification and counting.
//!
//! A detector label is mapped to one of four tracked categories by an ordered
//! keyword table (first match wins). Detections below the confidence threshold
//! are dropped before anything else sees them; confident detections with no
//! matching rule are kept for drawing but never counted.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::detect::Detection;

/// Default confidence threshold (inclusive).
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Car,
    Person,
    Truck,
    Motorcycle,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Car,
        Category::Person,
        Category::Truck,
        Category::Motorcycle,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Category::Car => "car",
            Category::Person => "person",
            Category::Truck => "truck",
            Category::Motorcycle => "motorcycle",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One keyword → category rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRule {
    pub keyword: String,
    pub category: Category,
}

impl LabelRule {
    pub fn new(keyword: &str, category: Category) -> Self {
        Self {
            keyword: keyword.to_string(),
            category,
        }
    }
}

/// Ordered, case-insensitive substring rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelTable {
    rules: Vec<LabelRule>,
}

impl LabelTable {
    pub fn new(rules: Vec<LabelRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let keyword = rule.keyword.trim().to_lowercase();
                if keyword.is_empty() {
                    return Err(anyhow!("label rule for {} has an empty keyword", rule.category));
                }
                Ok(LabelRule {
                    keyword,
                    category: rule.category,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn default_rules() -> Vec<LabelRule> {
        use Category::*;
        [
            ("car", Car),
            ("automobile", Car),
            ("sedan", Car),
            ("suv", Car),
            ("person", Person),
            ("people", Person),
            ("pedestrian", Person),
            ("truck", Truck),
            ("bus", Truck),
            ("semi", Truck),
            ("lorry", Truck),
            ("van", Truck),
            ("motorcycle", Motorcycle),
            ("motorbike", Motorcycle),
            ("scooter", Motorcycle),
        ]
        .into_iter()
        .map(|(keyword, category)| LabelRule::new(keyword, category))
        .collect()
    }

    pub fn classify(&self, label: &str) -> Option<Category> {
        let label = label.to_lowercase();
        self.rules
            .iter()
            .find(|rule| label.contains(&rule.keyword))
            .map(|rule| rule.category)
    }

    pub fn rules(&self) -> &[LabelRule] {
        &self.rules
    }
}

impl Default for LabelTable {
    fn default() -> Self {
        Self {
            rules: Self::default_rules(),
        }
    }
}

/// Per-category tallies. Used both for one cycle and for running totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    pub cars: u64,
    pub people: u64,
    pub trucks: u64,
    pub motorcycles: u64,
}

impl CategoryCounts {
    pub fn get(&self, category: Category) -> u64 {
        match category {
            Category::Car => self.cars,
            Category::Person => self.people,
            Category::Truck => self.trucks,
            Category::Motorcycle => self.motorcycles,
        }
    }

    pub fn increment(&mut self, category: Category) {
        let slot = match category {
            Category::Car => &mut self.cars,
            Category::Person => &mut self.people,
            Category::Truck => &mut self.trucks,
            Category::Motorcycle => &mut self.motorcycles,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn add(&mut self, other: &CategoryCounts) {
        for category in Category::ALL {
            let value = other.get(category);
            let slot = match category {
                Category::Car => &mut self.cars,
                Category::Person => &mut self.people,
                Category::Truck => &mut self.trucks,
                Category::Motorcycle => &mut self.motorcycles,
            };
            *slot = slot.saturating_add(value);
        }
    }

    pub fn total(&self) -> u64 {
        Category::ALL.iter().map(|c| self.get(*c)).sum()
    }
}

/// A detection that passed the confidence filter.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifiedDetection {
    pub detection: Detection,
    pub category: Option<Category>,
}

/// Outcome of one detection cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    pub retained: Vec<ClassifiedDetection>,
    pub cycle: CategoryCounts,
    pub discarded: usize,
}

impl CycleReport {
    /// Confident detections this cycle, counted or not.
    pub fn detection_count(&self) -> usize {
        self.retained.len()
    }
}

pub struct ResultProcessor {
    threshold: f32,
    table: LabelTable,
    totals: CategoryCounts,
}

impl ResultProcessor {
    pub fn new(threshold: f32, table: LabelTable) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        Ok(Self {
            threshold,
            table,
            totals: CategoryCounts::default(),
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn table(&self) -> &LabelTable {
        &self.table
    }

    /// Filter, classify and count one cycle's detections.
    pub fn process(&mut self, detections: Vec<Detection>) -> CycleReport {
        let mut report = CycleReport::default();
        for detection in detections {
            // NaN fails this comparison and is discarded with the rest.
            if !(detection.confidence >= self.threshold) {
                report.discarded += 1;
                continue;
            }
            let category = self.table.classify(&detection.label);
            if let Some(category) = category {
                report.cycle.increment(category);
            }
            report.retained.push(ClassifiedDetection {
                detection,
                category,
            });
        }
        self.totals.add(&report.cycle);
        log::debug!(
            "cycle: {} retained, {} discarded, counted {:?}",
            report.retained.len(),
            report.discarded,
            report.cycle
        );
        report
    }

    pub fn totals(&self) -> CategoryCounts {
        self.totals
    }

    pub fn reset(&mut self) {
        self.totals = CategoryCounts::default();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionLevel {
    FreeFlow,
    Light,
    Moderate,
    Heavy,
}

impl CongestionLevel {
    pub fn from_vehicle_count(vehicles: u64) -> Self {
        if vehicles > 50 {
            CongestionLevel::Heavy
        } else if vehicles > 25 {
            CongestionLevel::Moderate
        } else if vehicles > 10 {
            CongestionLevel::Light
        } else {
            CongestionLevel::FreeFlow
        }
    }
}

impl std::fmt::Display for CongestionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CongestionLevel::FreeFlow => "free flow",
            CongestionLevel::Light => "light",
            CongestionLevel::Moderate => "moderate",
            CongestionLevel::Heavy => "heavy",
        };
        f.write_str(text)
    }
}

/// Summary derived from running totals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TrafficAnalysis {
    pub vehicles: u64,
    pub people: u64,
    pub congestion: CongestionLevel,
}

impl TrafficAnalysis {
    pub fn from_counts(counts: &CategoryCounts) -> Self {
        let vehicles = counts.cars + counts.trucks + counts.motorcycles;
        Self {
            vehicles,
            people: counts.people,
            congestion: CongestionLevel::from_vehicle_count(vehicles),
        }
    }
}

/// Emitted after every completed cycle. Not persisted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub timestamp_ms: u64,
    pub camera_id: String,
    pub detections: usize,
    pub cycle: CategoryCounts,
    pub totals: CategoryCounts,
    pub analysis: TrafficAnalysis,
}

impl DetectionEvent {
    pub fn new(camera_id: &str, report: &CycleReport, totals: CategoryCounts) -> Self {
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            camera_id: camera_id.to_string(),
            detections: report.detection_count(),
            cycle: report.cycle,
            totals,
            analysis: TrafficAnalysis::from_counts(&totals),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn det(label: &str, confidence: f32) -> Detection {
        Detection::new(label, confidence, BoundingBox::new(0.0, 0.0, 10.0, 10.0))
    }

    #[test]
    fn person_counted_low_confidence_car_dropped() {
        let mut processor =
            ResultProcessor::new(DEFAULT_CONFIDENCE_THRESHOLD, LabelTable::default()).unwrap();
        let report = processor.process(vec![
            Detection::new("person", 0.9, BoundingBox::from_xywh([10.0, 10.0, 50.0, 100.0])),
            Detection::new("car", 0.4, BoundingBox::from_xywh([0.0, 0.0, 20.0, 20.0])),
        ]);
        assert_eq!(report.cycle.people, 1);
        assert_eq!(report.cycle.cars, 0);
        assert_eq!(report.discarded, 1);
        assert_eq!(processor.totals().people, 1);
        assert_eq!(processor.totals().cars, 0);
    }

    #[test]
    fn threshold_is_inclusive_and_nan_dropped() {
        let mut processor =
            ResultProcessor::new(DEFAULT_CONFIDENCE_THRESHOLD, LabelTable::default()).unwrap();
        let report = processor.process(vec![det("car", 0.5), det("car", f32::NAN)]);
        assert_eq!(report.cycle.cars, 1);
        assert_eq!(report.discarded, 1);
    }

    #[test]
    fn classification_first_match_wins() {
        let table = LabelTable::default();
        assert_eq!(table.classify("Police Car"), Some(Category::Car));
        assert_eq!(table.classify("school bus"), Some(Category::Truck));
        assert_eq!(table.classify("motorbike"), Some(Category::Motorcycle));
        assert_eq!(table.classify("PEDESTRIAN"), Some(Category::Person));
        assert_eq!(table.classify("traffic light"), None);
        // "scar" contains "car": substring matching is deliberate.
        assert_eq!(table.classify("scar"), Some(Category::Car));
    }

    #[test]
    fn unmatched_labels_drawn_not_counted() {
        let mut processor =
            ResultProcessor::new(DEFAULT_CONFIDENCE_THRESHOLD, LabelTable::default()).unwrap();
        let report = processor.process(vec![det("dog", 0.95)]);
        assert_eq!(report.detection_count(), 1);
        assert_eq!(report.retained[0].category, None);
        assert_eq!(processor.totals().total(), 0);
    }

    #[test]
    fn totals_accumulate_until_reset() {
        let mut processor =
            ResultProcessor::new(DEFAULT_CONFIDENCE_THRESHOLD, LabelTable::default()).unwrap();
        let mut previous = processor.totals();
        for _ in 0..3 {
            processor.process(vec![det("car", 0.8), det("truck", 0.7)]);
            let now = processor.totals();
            for category in Category::ALL {
                assert!(now.get(category) >= previous.get(category));
            }
            previous = now;
        }
        assert_eq!(previous.cars, 3);
        assert_eq!(previous.trucks, 3);
        processor.reset();
        assert_eq!(processor.totals(), CategoryCounts::default());
    }

    #[test]
    fn rejects_bad_threshold_and_empty_keyword() {
        assert!(ResultProcessor::new(1.5, LabelTable::default()).is_err());
        assert!(LabelTable::new(vec![LabelRule::new("  ", Category::Car)]).is_err());
        let table = LabelTable::new(vec![LabelRule::new(" Tuk-Tuk ", Category::Motorcycle)]).unwrap();
        assert_eq!(table.classify("tuk-tuk"), Some(Category::Motorcycle));
    }

    #[test]
    fn congestion_levels() {
        let mut counts = CategoryCounts::default();
        assert_eq!(
            TrafficAnalysis::from_counts(&counts).congestion,
            CongestionLevel::FreeFlow
        );
        counts.cars = 11;
        assert_eq!(
            TrafficAnalysis::from_counts(&counts).congestion,
            CongestionLevel::Light
        );
        counts.trucks = 15;
        assert_eq!(
            TrafficAnalysis::from_counts(&counts).congestion,
            CongestionLevel::Moderate
        );
        counts.motorcycles = 25;
        counts.people = 100;
        let analysis = TrafficAnalysis::from_counts(&counts);
        assert_eq!(analysis.congestion, CongestionLevel::Heavy);
        assert_eq!(analysis.vehicles, 51);
        assert_eq!(analysis.people, 100);
    }
}
