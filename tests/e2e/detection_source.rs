#[path = "../common/mod.rs"]
mod common;

use common::*;
use reelset::capability::CapabilityRegistry;
use reelset::pipeline::{MediaSource, PipelineOptions};

struct Tiers {
    detector: DetectorTier,
    face: DetectorTier,
    heuristic: DetectorTier,
}

impl Tiers {
    fn new() -> Self {
        Self { detector: DetectorTier::default(), face: DetectorTier::default(), heuristic: DetectorTier::default() }
    }

    fn registry(&self, detector_loads: bool) -> CapabilityRegistry {
        let registry = if detector_loads {
            CapabilityRegistry::new().with_detector("recording", self.detector.loader())
        } else {
            CapabilityRegistry::new().with_detector("recording", self.detector.failing_loader())
        };
        registry
            .with_face_detector("recording", self.face.loader())
            .with_heuristic_detector("recording", self.heuristic.loader())
    }
}

/// Runs every stage except upscaling over three frames and returns the
/// number of images in the archive.
async fn crop_three_frames(registry: CapabilityRegistry, use_face_detector: bool) -> usize {
    let ws = Workspace::new();
    write_frames(
        &ws.input,
        &[noise_frame(1, Palette::Gray), noise_frame(2, Palette::Gray), noise_frame(3, Palette::Gray)],
    );
    let pipeline = ws.pipeline(registry);
    let opts = PipelineOptions {
        trigger_word: "aiko".to_string(),
        skip_upscaling: true,
        use_face_detector,
        ..Default::default()
    };
    let archive = pipeline.run(&MediaSource::ImageSet(ws.input.clone()), &ws.output, &opts, None).await.unwrap();
    names_under(&read_archive(&archive), "images/").len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_object_detector_is_preferred() {
    let tiers = Tiers::new();

    let images = crop_three_frames(tiers.registry(true), true).await;

    assert_eq!(images, 3, "frames without detections pass through");
    assert_eq!(tiers.detector.loads(), 1);
    assert!(tiers.detector.detects() > 0);
    assert_eq!((tiers.face.loads(), tiers.face.detects()), (0, 0));
    assert_eq!((tiers.heuristic.loads(), tiers.heuristic.detects()), (0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_detector_falls_back_to_face_detector() {
    let tiers = Tiers::new();

    let images = crop_three_frames(tiers.registry(false), true).await;

    assert_eq!(images, 3);
    assert!(tiers.detector.loads() >= 1, "the object detector was attempted");
    assert_eq!(tiers.detector.detects(), 0);
    assert_eq!(tiers.face.loads(), 1);
    // Face detection runs one image at a time.
    assert_eq!(tiers.face.detects(), 3);
    assert_eq!((tiers.heuristic.loads(), tiers.heuristic.detects()), (0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disabled_face_detector_goes_to_heuristic() {
    let tiers = Tiers::new();

    let images = crop_three_frames(tiers.registry(false), false).await;

    assert_eq!(images, 3);
    assert_eq!(tiers.detector.detects(), 0);
    assert_eq!((tiers.face.loads(), tiers.face.detects()), (0, 0));
    assert_eq!(tiers.heuristic.loads(), 1);
    assert_eq!(tiers.heuristic.detects(), 3);
}
