#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use common::*;
use reelset::capability::{CapabilityRegistry, SharedDetector, SharedEmbedder, SharedTagger};
use reelset::error::PipelineError;
use reelset::pipeline::{MediaSource, PipelineOptions, StageKind};

fn options() -> PipelineOptions {
    PipelineOptions { trigger_word: "aiko".to_string(), ..Default::default() }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_skip_all_keeps_frames_byte_identical() {
    let ws = Workspace::new();
    let sources = write_frames(&ws.input, &ten_frames_seven_distinct());
    let pipeline = ws.pipeline(CapabilityRegistry::new());
    let progress = ProgressLog::default();
    let cb = progress.callback();

    let archive = pipeline
        .run(&MediaSource::ImageSet(ws.input.clone()), &ws.output, &options().skip_all(), Some(&cb))
        .await
        .unwrap();

    let entries = read_archive(&archive);
    assert!(names_under(&entries, "captions/").is_empty());
    assert_eq!(names_under(&entries, "images/").len(), 10);
    for (src, (name, data)) in sources.iter().zip(&entries) {
        assert_eq!(name, &format!("images/{}", src.file_name().unwrap().to_str().unwrap()));
        assert_eq!(data, &std::fs::read(src).unwrap());
    }

    let events = progress.events();
    let indices: Vec<usize> = events.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, (0..=8).collect::<Vec<_>>());
    assert_eq!(events[0].1, "Starting");
    assert_eq!(events[1].1, "Frame Extraction");
    for (stage, (_, label)) in StageKind::ALL[1..].iter().zip(&events[2..8]) {
        assert_eq!(label, &format!("{} (skipped)", stage.label()));
    }
    assert_eq!(events[8].1, "Packaging");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_progress_reports_every_stage_in_order() {
    let ws = Workspace::new();
    write_frames(&ws.input, &[noise_frame(1, Palette::Gray), noise_frame(2, Palette::Gray)]);
    let pipeline = ws.pipeline(CapabilityRegistry::new());
    let progress = ProgressLog::default();
    let cb = progress.callback();
    let opts = PipelineOptions { skip_upscaling: true, ..options() };

    pipeline.run(&MediaSource::ImageSet(ws.input.clone()), &ws.output, &opts, Some(&cb)).await.unwrap();

    let labels: Vec<String> = progress.events().into_iter().map(|(_, l)| l).collect();
    assert_eq!(
        labels,
        vec![
            "Starting",
            "Frame Extraction",
            "Deduplication",
            "Filtering",
            "Upscaling (skipped)",
            "Cropping",
            "Annotation",
            "Classification",
            "Packaging",
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_runs_produce_same_dataset() {
    let ws = Workspace::new();
    write_frames(&ws.input, &ten_frames_seven_distinct());
    let pipeline = ws.pipeline(CapabilityRegistry::new());
    let source = MediaSource::ImageSet(ws.input.clone());
    let opts = PipelineOptions { skip_upscaling: true, ..options() };

    let first = read_archive(&pipeline.run(&source, &ws.output, &opts, None).await.unwrap());
    let second = read_archive(&pipeline.run(&source, &ws.output, &opts, None).await.unwrap());
    assert_eq!(first, second);
    assert!(!ws.output.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsupported_video_leaves_nothing_behind() {
    let ws = Workspace::new();
    let clip = ws.tmp.path().join("clip.gif");
    std::fs::write(&clip, b"GIF89a").unwrap();
    std::fs::create_dir_all(ws.output.join("stale")).unwrap();
    let pipeline = ws.pipeline(CapabilityRegistry::new());
    let progress = ProgressLog::default();
    let cb = progress.callback();

    let err = pipeline.run(&MediaSource::Video(clip), &ws.output, &options(), Some(&cb)).await.unwrap_err();

    assert!(matches!(err, PipelineError::UnsupportedFormat(_)), "got {err:?}");
    assert!(progress.events().is_empty(), "no stage runs for an unsupported container");
    assert!(!ws.output.exists());
    assert!(!ws.archive().exists());
    assert!(!ws.work.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stage_failure_cleans_up() {
    let ws = Workspace::new();
    write_frames(&ws.input, &[noise_frame(1, Palette::Gray), noise_frame(2, Palette::Gray)]);
    let registry =
        CapabilityRegistry::new().with_detector("broken", || Ok(Arc::new(BrokenDetector) as SharedDetector));
    let pipeline = ws.pipeline(registry);
    let opts = PipelineOptions { skip_upscaling: true, ..options() };

    let err = pipeline.run(&MediaSource::ImageSet(ws.input.clone()), &ws.output, &opts, None).await.unwrap_err();

    match err {
        PipelineError::StageExecution { stage, source } => {
            assert_eq!(stage, StageKind::Cropping);
            assert!(source.to_string().contains("inference backend crashed"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!ws.output.exists());
    assert!(!ws.archive().exists());
    assert!(!ws.work.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tagger_sorts_and_embedder_groups_unclassified() {
    let ws = Workspace::new();
    let frames = [
        noise_frame(1, Palette::Warm),
        noise_frame(2, Palette::Blue),
        noise_frame(3, Palette::Green),
        noise_frame(4, Palette::Blue),
        noise_frame(5, Palette::Green),
        noise_frame(6, Palette::Warm),
    ];
    write_frames(&ws.input, &frames);
    let registry = CapabilityRegistry::new()
        .with_tagger("palette", || Ok(Arc::new(PaletteTagger) as SharedTagger))
        .with_embedder("color", || Ok(Arc::new(ColorEmbedder) as SharedEmbedder));
    let pipeline = ws.pipeline(registry);
    let opts = PipelineOptions { skip_upscaling: true, cluster_count: Some(2), ..options() };

    let archive = pipeline.run(&MediaSource::ImageSet(ws.input.clone()), &ws.output, &opts, None).await.unwrap();

    let entries = read_archive(&archive);
    assert_eq!(
        names_under(&entries, "images/"),
        vec![
            "images/blonde_blue/frame_0001.png",
            "images/blonde_blue/frame_0006.png",
            "images/unclassified/cluster_00/frame_0002.png",
            "images/unclassified/cluster_00/frame_0004.png",
            "images/unclassified/cluster_01/frame_0003.png",
            "images/unclassified/cluster_01/frame_0005.png",
        ]
    );
    let caption = |name: &str| {
        let (_, data) = entries.iter().find(|(n, _)| n == name).unwrap();
        String::from_utf8(data.clone()).unwrap()
    };
    assert_eq!(caption("captions/frame_0001.txt"), "aiko, blonde hair, blue eyes, smile");
    assert_eq!(caption("captions/frame_0002.txt"), "aiko, smile, 1girl");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_image_folder_yields_empty_dataset() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(CapabilityRegistry::new());

    let archive = pipeline.run(&MediaSource::ImageSet(ws.input.clone()), &ws.output, &options(), None).await.unwrap();

    let entries = read_archive(&archive);
    assert!(names_under(&entries, "images/").iter().all(|n| !n.ends_with(".png")));
    assert!(!ws.work.exists());
}
