//! Worker integration tests: real OME-TIFF input, SQLite queue, imagery and
//! result stores on disk.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sparc_db::{NewIngestRecord, NewPreprocessJob, NewSnapshot, Project, SparcDb};
use sparc_preprocess::build_pool;
use sparc_protocol::defaults::{CORRECTED_COMPONENT, SOURCE_COMPONENT};
use sparc_protocol::{JobStatus, TaskKind};
use sparc_security::{ProjectLayout, ProjectManager};
use sparc_sinks::{annotation_path, AnnotationStore, ZarrStore};
use sparc_worker::{
    process_next, ImageReader, JobContext, OmeTiffReader, SummaryStatus, Worker, WorkerConfig,
};
use tempfile::TempDir;
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

const CHANNELS: usize = 2;
const SLICES: usize = 2;
const HEIGHT: u32 = 24;
const WIDTH: u32 = 32;

fn ome_xml() -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OME xmlns="http://www.openmicroscopy.org/Schemas/OME/2016-06">
  <Image ID="Image:0" Name="demo">
    <Pixels ID="Pixels:0" DimensionOrder="XYZCT" Type="uint16" SizeX="{WIDTH}" SizeY="{HEIGHT}" SizeZ="{SLICES}" SizeC="{CHANNELS}" SizeT="1" PhysicalSizeX="0.5" PhysicalSizeY="0.5" PhysicalSizeZ="2.0">
      <Channel ID="Channel:0:0" Name="DAPI" SamplesPerPixel="1"/>
      <Channel ID="Channel:0:1" Name="CD3" SamplesPerPixel="1"/>
    </Pixels>
  </Image>
</OME>"#
    )
}

/// Plane value: a smooth ramp per (c, z) plus a bright square.
fn pixel(c: usize, z: usize, y: u32, x: u32) -> u16 {
    let ramp = 100 * (c as u16 + 1) + 10 * z as u16 + (x / 4) as u16;
    let spot = (10..14).contains(&y) && (12..16).contains(&x);
    if spot {
        ramp + 500
    } else {
        ramp
    }
}

fn write_ome_tiff(path: &Path) {
    let mut encoder = TiffEncoder::new(File::create(path).unwrap()).unwrap();
    let xml = ome_xml();
    // XYZCT: z varies fastest across pages.
    for c in 0..CHANNELS {
        for z in 0..SLICES {
            let data: Vec<u16> = (0..HEIGHT)
                .flat_map(|y| (0..WIDTH).map(move |x| pixel(c, z, y, x)))
                .collect();
            let mut image = encoder.new_image::<colortype::Gray16>(WIDTH, HEIGHT).unwrap();
            if c == 0 && z == 0 {
                image
                    .encoder()
                    .write_tag(Tag::ImageDescription, xml.as_str())
                    .unwrap();
            }
            image.write_data(&data).unwrap();
        }
    }
}

struct Fixture {
    _tmp: TempDir,
    db: SparcDb,
    layout: ProjectLayout,
    project: Project,
    ctx: Arc<JobContext>,
}

async fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let db = SparcDb::open(tmp.path().join("sparc.sqlite")).await.unwrap();
    let projects = ProjectManager::new(tmp.path().join("projects")).unwrap();
    let layout = projects.initialize("demo").unwrap();
    let project = db
        .upsert_project("demo", "Demo", None, &layout.root.display().to_string())
        .await
        .unwrap();
    write_ome_tiff(&layout.imagery().join("image.ome.tiff"));

    let ctx = Arc::new(JobContext::new(
        db.clone(),
        projects,
        Arc::new(OmeTiffReader),
        build_pool(Some(2)).unwrap(),
    ));
    Fixture {
        _tmp: tmp,
        db,
        layout,
        project,
        ctx,
    }
}

fn snapshot(layout: &ProjectLayout) -> NewSnapshot {
    NewSnapshot {
        run_name: "run-1".to_string(),
        manifest_path: layout
            .snapshots()
            .join("20240101T000000Z_run-1.json")
            .display()
            .to_string(),
        git_hash: None,
        dependencies: vec![],
        inputs: vec![],
        created_at: chrono::Utc::now(),
    }
}

async fn submit_ingest(fx: &Fixture, panel: Option<PathBuf>) -> i64 {
    let submission = fx
        .db
        .create_ingest_submission(
            fx.project.id,
            &snapshot(&fx.layout),
            &NewIngestRecord {
                source_path: "imagery/image.ome.tiff".to_string(),
                panel_csv_path: panel.map(|p| p.display().to_string()),
                convert_to_zarr: true,
                request_metadata: serde_json::Map::new(),
            },
        )
        .await
        .unwrap();
    submission.record.id
}

fn worker(fx: &Fixture) -> Worker {
    Worker::new(
        Arc::clone(&fx.ctx),
        WorkerConfig {
            worker_id: "test-worker".to_string(),
            poll_interval: Duration::from_millis(10),
        },
    )
    .0
}

#[test]
fn reader_decodes_ome_pages_in_czyx_order() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("image.ome.tiff");
    write_ome_tiff(&path);

    let meta = OmeTiffReader.read_metadata(&path).unwrap();
    assert_eq!(meta.dims.shape(), [CHANNELS, SLICES, HEIGHT as usize, WIDTH as usize]);
    assert_eq!(meta.channel_names, vec![Some("DAPI".to_string()), Some("CD3".to_string())]);
    assert_eq!(meta.physical_sizes.z, Some(2.0));

    let volume = OmeTiffReader.read_volume(&path).unwrap();
    let plane = sparc_preprocess::PlaneSource::read_plane(&volume, 1, 1).unwrap();
    assert_eq!(plane[[0, 0]], f64::from(pixel(1, 1, 0, 0)));
    assert_eq!(plane[[11, 13]], f64::from(pixel(1, 1, 11, 13)));
}

#[tokio::test]
async fn ingest_then_preprocess() {
    let fx = fixture().await;
    let panel = fx.layout.configs().join("panel.csv");
    fs::write(&panel, "channel,target\nDAPI,Nuclei\n").unwrap();
    let record_id = submit_ingest(&fx, Some(panel)).await;

    assert_eq!(worker(&fx).run_once().await.unwrap(), 1);

    let record = fx.db.get_ingest_record(record_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.error_message, None);
    let zarr_path = PathBuf::from(record.zarr_path.clone().unwrap());
    assert!(zarr_path.ends_with("imagery/image.ome.zarr"));
    let channels = record.channel_metadata.clone().unwrap();
    assert_eq!(channels[0].remapped_name.as_deref(), Some("Nuclei"));
    assert_eq!(channels[1].name, "CD3");
    assert_eq!(record.scale_metadata.unwrap().x, 0.5);
    assert!(ZarrStore::open(&zarr_path).unwrap().has_array(SOURCE_COMPONENT));

    let submission = fx
        .db
        .create_preprocess_submission(&NewPreprocessJob {
            project_id: fx.project.id,
            ingest_record_id: record_id,
            method: "morphological".to_string(),
            output_name: "bg_run".to_string(),
            parameters: json!({"opening_radius": 3}).as_object().cloned().unwrap(),
            channels: Some(vec![1]),
        })
        .await
        .unwrap();
    assert_eq!(worker(&fx).run_once().await.unwrap(), 1);

    let job = fx
        .db
        .get_preprocess_job(submission.job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    assert_eq!(job.progress, 1.0);
    let qc = job.qc_metrics.unwrap();
    assert_eq!(qc.per_channel.len(), 1);
    assert_eq!(qc.per_channel[0].channel_index, 0);
    assert!(qc.corrected.min >= 0.0);

    let result = ZarrStore::open(job.result_path.unwrap()).unwrap();
    let corrected = result.open_array(CORRECTED_COMPONENT).unwrap();
    assert_eq!(corrected.meta().shape, vec![1, SLICES, HEIGHT as usize, WIDTH as usize]);
    assert_eq!(result.read_attrs().unwrap()["channels"], json!([1]));

    let annotations = AnnotationStore::open(annotation_path(&fx.layout.h5ad(), "image.ome"))
        .await
        .unwrap();
    let summary = annotations.get("bg_run").await.unwrap().unwrap();
    assert_eq!(summary.method, "morphological");
    assert_eq!(summary.channels, vec![1]);
}

#[tokio::test]
async fn missing_panel_fails_with_message_and_redispatch_is_skipped() {
    let fx = fixture().await;
    let record_id = submit_ingest(&fx, Some(PathBuf::from("configs/missing.csv"))).await;

    let summary = process_next(&fx.ctx, "w1").await.unwrap().unwrap();
    assert_eq!(summary.status, SummaryStatus::Failed);

    let record = fx.db.get_ingest_record(record_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    let message = record.error_message.clone().unwrap();
    assert!(message.starts_with("Panel CSV not found: "), "{message}");
    assert!(message.ends_with("missing.csv"));

    fx.db
        .enqueue(TaskKind::IngestImage, &json!({ "ingest_record_id": record_id }))
        .await
        .unwrap();
    let again = process_next(&fx.ctx, "w1").await.unwrap().unwrap();
    assert_eq!(again.status, SummaryStatus::Skipped);
    let unchanged = fx.db.get_ingest_record(record_id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, JobStatus::Failed);
    assert_eq!(unchanged.error_message, record.error_message);
    assert!(process_next(&fx.ctx, "w1").await.unwrap().is_none());
}

#[tokio::test]
async fn domain_failures_keep_their_message() {
    let fx = fixture().await;
    let record_id = submit_ingest(&fx, None).await;
    worker(&fx).run_once().await.unwrap();

    let out_of_range = fx
        .db
        .create_preprocess_submission(&NewPreprocessJob {
            project_id: fx.project.id,
            ingest_record_id: record_id,
            method: "basic".to_string(),
            output_name: "too_far".to_string(),
            parameters: serde_json::Map::new(),
            channels: Some(vec![7]),
        })
        .await
        .unwrap();
    let unknown = fx
        .db
        .create_preprocess_submission(&NewPreprocessJob {
            project_id: fx.project.id,
            ingest_record_id: record_id,
            method: "fft".to_string(),
            output_name: "fft".to_string(),
            parameters: serde_json::Map::new(),
            channels: None,
        })
        .await
        .unwrap();
    assert_eq!(worker(&fx).run_once().await.unwrap(), 2);

    let job = fx
        .db
        .get_preprocess_job(out_of_range.job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("Channel 7 out of range for image with 2 channels")
    );

    let job = fx.db.get_preprocess_job(unknown.job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("Unsupported background method 'fft'")
    );
    assert!(!fx.layout.imagery().join("fft.zarr").exists());
}

#[tokio::test]
async fn spawned_worker_drains_queue_and_shuts_down() {
    let fx = fixture().await;
    let handle = Worker::spawn(
        Arc::clone(&fx.ctx),
        WorkerConfig {
            worker_id: "bg".to_string(),
            poll_interval: Duration::from_millis(10),
        },
    );
    let record_id = submit_ingest(&fx, None).await;

    let mut status = JobStatus::Queued;
    for _ in 0..500 {
        status = fx
            .db
            .get_ingest_record(record_id)
            .await
            .unwrap()
            .unwrap()
            .status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, JobStatus::Completed);
    handle.shutdown().await.unwrap();
}
