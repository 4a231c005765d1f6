//! End-to-end: submissions through the service, processing through a worker
//! sharing the same state store and project tree.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use sparc::{
    BackgroundRequest, IngestRequest, RunRequest, RunSubmitted, ServiceError, SnapshotManager,
    SparcService,
};
use sparc_db::SparcDb;
use sparc_preprocess::{build_pool, MethodCatalog};
use sparc_protocol::defaults::{BACKGROUND_COMPONENT, CORRECTED_COMPONENT};
use sparc_protocol::JobStatus;
use sparc_security::ProjectManager;
use sparc_sinks::ZarrStore;
use sparc_worker::{JobContext, OmeTiffReader, Worker, WorkerConfig};
use tempfile::TempDir;
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

const WIDTH: u32 = 20;
const HEIGHT: u32 = 16;

fn write_ome_tiff(path: &Path) {
    let xml = format!(
        r#"<OME><Image ID="Image:0"><Pixels DimensionOrder="XYZCT" SizeX="{WIDTH}" SizeY="{HEIGHT}" SizeZ="1" SizeC="2" SizeT="1" PhysicalSizeX="0.65" PhysicalSizeY="0.65"><Channel Name="DAPI"/><Channel Name="CD8"/></Pixels></Image></OME>"#
    );
    let mut encoder = TiffEncoder::new(File::create(path).unwrap()).unwrap();
    for c in 0..2u16 {
        let data: Vec<u16> = (0..HEIGHT)
            .flat_map(|y| (0..WIDTH).map(move |x| 200 * (c + 1) + (x + y) as u16))
            .collect();
        let mut image = encoder.new_image::<colortype::Gray16>(WIDTH, HEIGHT).unwrap();
        if c == 0 {
            image
                .encoder()
                .write_tag(Tag::ImageDescription, xml.as_str())
                .unwrap();
        }
        image.write_data(&data).unwrap();
    }
}

struct Harness {
    tmp: TempDir,
    service: SparcService,
    ctx: Arc<JobContext>,
}

impl Harness {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let db = SparcDb::open(tmp.path().join("sparc.sqlite")).await.unwrap();
        let projects_root = tmp.path().join("projects");
        let service = SparcService::new(
            db.clone(),
            ProjectManager::new(&projects_root).unwrap(),
            SnapshotManager::new(tmp.path()),
            MethodCatalog::builtin(),
        );
        let ctx = Arc::new(JobContext::new(
            db,
            ProjectManager::new(&projects_root).unwrap(),
            Arc::new(OmeTiffReader),
            build_pool(Some(2)).unwrap(),
        ));
        Self { tmp, service, ctx }
    }

    async fn drain(&self) -> usize {
        let (worker, _tx) = Worker::new(
            Arc::clone(&self.ctx),
            WorkerConfig {
                worker_id: "e2e".to_string(),
                poll_interval: Duration::from_millis(10),
            },
        );
        worker.run_once().await.unwrap()
    }

    /// Project `demo` with an image and a panel under its root.
    async fn demo_project(&self) -> PathBuf {
        let project = self.service.create_project("demo", Some("Demo"), None).await.unwrap();
        let root = PathBuf::from(&project.layout.root);
        write_ome_tiff(&root.join("imagery").join("image.ome.tiff"));
        fs::write(
            root.join("configs").join("panel.csv"),
            "Channel Name,Marker\nCD8,Cytotoxic T\n",
        )
        .unwrap();
        root
    }

    async fn ingest(&self) -> i64 {
        let submitted = self
            .service
            .submit_ingest(&IngestRequest {
                project_slug: "demo".to_string(),
                run_name: "run-1".to_string(),
                image_path: PathBuf::from("imagery/image.ome.tiff"),
                convert_to_zarr: true,
                panel_csv_path: Some(PathBuf::from("configs/panel.csv")),
                metadata: Map::new(),
            })
            .await
            .unwrap();
        submitted.ingest_record_id
    }
}

fn background(ingest_record_id: i64, method: &str, parameters: Value) -> BackgroundRequest {
    BackgroundRequest {
        project_slug: "demo".to_string(),
        ingest_record_id,
        method: method.to_string(),
        output_name: "bg run".to_string(),
        parameters: parameters.as_object().cloned().unwrap_or_default(),
        channels: None,
    }
}

#[tokio::test]
async fn project_lifecycle() {
    let h = Harness::new().await;

    let created = h.service.create_project("alpha", None, Some("first")).await.unwrap();
    assert_eq!(created.title, "alpha");
    assert!(PathBuf::from(&created.layout.snapshots).is_dir());
    assert!(PathBuf::from(&created.layout.h5ad).ends_with("h5ad"));

    h.service.create_project("beta", Some("Beta"), None).await.unwrap();
    let updated = h.service.create_project("alpha", Some("Alpha"), None).await.unwrap();
    assert_eq!(updated.title, "Alpha");
    assert_eq!(updated.created_at, created.created_at);

    let slugs: Vec<_> = h
        .service
        .list_projects()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.slug)
        .collect();
    assert_eq!(slugs, vec!["alpha", "beta"]);

    h.service.delete_project("alpha").await.unwrap();
    assert!(!PathBuf::from(&created.root_path).exists());
    assert!(h.service.get_project("alpha").await.unwrap_err().is_not_found());
    assert!(h.service.delete_project("alpha").await.unwrap_err().is_not_found());

    let err = h.service.create_project("Bad Slug", None, None).await.unwrap_err();
    assert!(err.is_validation(), "{err:?}");
}

#[tokio::test]
async fn ingest_then_background_correction() {
    let h = Harness::new().await;
    let root = h.demo_project().await;

    let submitted = h
        .service
        .submit_ingest(&IngestRequest {
            project_slug: "demo".to_string(),
            run_name: "run-1".to_string(),
            image_path: PathBuf::from("imagery/image.ome.tiff"),
            convert_to_zarr: true,
            panel_csv_path: Some(PathBuf::from("configs/panel.csv")),
            metadata: Map::new(),
        })
        .await
        .unwrap();
    let inputs = &submitted.snapshot.inputs;
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[0].path, "imagery/image.ome.tiff");
    assert_eq!(inputs[1].path, "configs/panel.csv");
    assert!(inputs.iter().all(|input| input.sha256.len() == 64));
    assert!(Path::new(&submitted.snapshot.manifest_path).is_file());

    let status = h.service.ingest_status(submitted.ingest_record_id).await.unwrap();
    assert_eq!(status.status, JobStatus::Queued);
    assert!(status.source_path.ends_with("imagery/image.ome.tiff"));
    assert!(Path::new(&status.source_path).is_absolute());

    assert_eq!(h.drain().await, 1);
    let record = h.service.ingest_status(submitted.ingest_record_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed, "{:?}", record.error_message);
    let zarr_path = record.zarr_path.clone().unwrap();
    assert!(Path::new(&zarr_path).starts_with(root.join("imagery")));
    let channels = record.channel_metadata.unwrap();
    assert_eq!(channels[1].remapped_name.as_deref(), Some("Cytotoxic T"));

    let queued = h
        .service
        .submit_background(&background(
            record.id,
            "basic",
            json!({"rolling_ball_radius": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(queued.status, JobStatus::Queued);

    assert_eq!(h.drain().await, 1);
    let job = h.service.preprocess_status(queued.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error_message);
    assert_eq!(job.output_name, "bg_run");
    assert_eq!(job.progress, 1.0);

    let result_path = PathBuf::from(job.result_path.clone().unwrap());
    assert!(result_path.ends_with("imagery/bg_run.zarr"));
    let store = ZarrStore::open(&result_path).unwrap();
    assert!(store.has_array(CORRECTED_COMPONENT));
    assert!(store.has_array(BACKGROUND_COMPONENT));
    assert_eq!(
        store.open_array(CORRECTED_COMPONENT).unwrap().meta().shape,
        vec![2, 1, HEIGHT as usize, WIDTH as usize]
    );

    let qc = serde_json::to_value(job.qc_metrics.unwrap()).unwrap();
    let mut keys: Vec<_> = qc.as_object().unwrap().keys().cloned().collect();
    keys.sort();
    assert_eq!(keys, vec!["background", "corrected", "per_channel", "raw"]);
    assert_eq!(qc["per_channel"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn background_for_unknown_ingest_record_persists_nothing() {
    let h = Harness::new().await;
    h.demo_project().await;

    let err = h
        .service
        .submit_background(&background(999, "basic", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(ref m) if m == "Ingest record not found for project"));

    let record_id = h.ingest().await;
    h.service.create_project("other", None, None).await.unwrap();
    let mut foreign = background(record_id, "basic", json!({}));
    foreign.project_slug = "other".to_string();
    assert!(h.service.submit_background(&foreign).await.unwrap_err().is_not_found());

    assert_eq!(h.service.db().count_preprocess_jobs().await.unwrap(), 0);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_anything_is_written() {
    let h = Harness::new().await;
    let root = h.demo_project().await;
    fs::write(h.tmp.path().join("outside.tiff"), b"x").unwrap();

    let err = h
        .service
        .submit_ingest(&IngestRequest {
            project_slug: "demo".to_string(),
            run_name: "escape".to_string(),
            image_path: PathBuf::from("../../outside.tiff"),
            convert_to_zarr: false,
            panel_csv_path: None,
            metadata: Map::new(),
        })
        .await
        .unwrap_err();
    assert!(err.is_validation(), "{err:?}");
    assert_eq!(fs::read_dir(root.join("configs").join("snapshots")).unwrap().count(), 0);

    let err = h
        .service
        .submit_ingest(&IngestRequest {
            project_slug: "nope".to_string(),
            run_name: "x".to_string(),
            image_path: PathBuf::from("imagery/image.ome.tiff"),
            convert_to_zarr: false,
            panel_csv_path: None,
            metadata: Map::new(),
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let record_id = h.ingest().await;
    let cases = [
        (background(record_id, "fft", json!({})), "Unknown method 'fft'"),
        (
            background(record_id, "basic", json!({"rolling_ball_radius": 900})),
            "Parameter 'rolling_ball_radius' above maximum 500",
        ),
        (
            background(record_id, "basic", json!({"radius": 3})),
            "Unsupported parameter 'radius'",
        ),
        (
            BackgroundRequest {
                channels: Some(vec![0, -1]),
                ..background(record_id, "basic", json!({}))
            },
            "Channel indices must be non-negative",
        ),
        (
            BackgroundRequest {
                output_name: "   ".to_string(),
                ..background(record_id, "basic", json!({}))
            },
            "Output name cannot be empty",
        ),
    ];
    for (request, message) in cases {
        let err = h.service.submit_background(&request).await.unwrap_err();
        assert!(err.is_validation(), "{err:?}");
        assert_eq!(err.to_string(), message);
    }
    assert_eq!(h.service.db().count_preprocess_jobs().await.unwrap(), 0);
}

#[tokio::test]
async fn run_config_file_submits_ingestion() {
    let h = Harness::new().await;
    h.demo_project().await;
    let config = h.tmp.path().join("run.yml");
    fs::write(
        &config,
        "project_slug: demo\nrun_name: from-config\nimage_path: imagery/image.ome.tiff\nmetadata:\n  operator: lab\n",
    )
    .unwrap();

    let request = sparc::load_run_config(&config).unwrap();
    assert!(matches!(request, RunRequest::Ingest(_)));
    let RunSubmitted::Ingest(submitted) = h.service.submit(&request).await.unwrap() else {
        panic!("expected an ingestion");
    };
    let record = h.service.ingest_status(submitted.ingest_record_id).await.unwrap();
    assert!(!record.convert_to_zarr);
    assert_eq!(record.request_metadata["operator"], "lab");
    assert_eq!(submitted.snapshot.run_name, "from-config");
    assert_eq!(submitted.project.slug, "demo");
}
