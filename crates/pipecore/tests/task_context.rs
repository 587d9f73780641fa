use pipecore::{
    Cardinality, ConfigError, Data, DataRegistry, Port, Ports, ProtocolSettings, Resources,
    TaskContext,
};
use std::sync::Arc;

struct Fixture {
    registry: Arc<DataRegistry>,
    inputs: Ports,
    outputs: Ports,
}

fn fixture() -> Fixture {
    let registry = Arc::new(DataRegistry::standard(&ProtocolSettings::default()));
    let formats = registry.formats();

    let mut inputs = Ports::new();
    inputs.add_port("reads", formats.get("fastq").unwrap()).unwrap();
    inputs
        .add(Port::new("known_sites", formats.get("vcf").unwrap()).with_cardinality(Cardinality::Optional))
        .unwrap();
    inputs
        .add(Port::new("index", formats.get("bowtie-index").unwrap()))
        .unwrap();

    let mut outputs = Ports::new();
    outputs.add_port("aligned", formats.get("bam").unwrap()).unwrap();

    Fixture {
        registry,
        inputs,
        outputs,
    }
}

impl Fixture {
    fn data(&self, name: &str, format: &str, references: &[&str]) -> Data {
        let files = references
            .iter()
            .map(|r| self.registry.resolve(r).unwrap())
            .collect();
        Data::new(name, self.registry.formats().get(format).unwrap(), files)
    }

    fn index(&self) -> Data {
        self.data(
            "index",
            "bowtie-index",
            &["/ref/hg38.1.bt2", "/ref/hg38.2.bt2", "/ref/hg38.rev.1.bt2"],
        )
    }
}

#[test]
fn test_build_complete_context() {
    let fx = fixture();
    let ctx = TaskContext::builder("align", "aligner", &fx.inputs, &fx.outputs)
        .input("reads", fx.data("reads", "fastq", &["/data/r1.fq"]))
        .input("index", fx.index())
        .output("aligned", fx.data("aligned", "bam", &["/out/r1.bam"]))
        .resources(Resources {
            cpus: 4,
            memory_mb: 8192,
            walltime_secs: Some(3600),
        })
        .work_dir("/scratch")
        .param("preset", "sensitive")
        .build()
        .unwrap();

    assert_eq!(ctx.step_id(), "align");
    assert_eq!(ctx.resources().cpus, 4);
    assert_eq!(ctx.param("preset"), Some("sensitive"));
    assert!(ctx.input("known_sites").is_none());
    assert_eq!(ctx.require_input("index").unwrap().len(), 3);

    let descriptor = ctx.descriptor();
    assert_eq!(descriptor.id, ctx.id());
    assert_eq!(descriptor.outputs["aligned"], vec!["/out/r1.bam".to_string()]);
    let json = serde_json::to_string(&descriptor).unwrap();
    assert!(json.contains("\"step_type\":\"aligner\""));
}

#[test]
fn test_missing_required_input() {
    let fx = fixture();
    let err = TaskContext::builder("align", "aligner", &fx.inputs, &fx.outputs)
        .input("index", fx.index())
        .build()
        .unwrap_err();
    assert_eq!(err, ConfigError::MissingBinding("reads".to_string()));
}

#[test]
fn test_output_must_be_writable() {
    let fx = fixture();
    let err = TaskContext::builder("align", "aligner", &fx.inputs, &fx.outputs)
        .input("reads", fx.data("reads", "fastq", &["/data/r1.fq"]))
        .input("index", fx.index())
        .output(
            "aligned",
            fx.data("aligned", "bam", &["derived:bam:/data/r1.sam"]),
        )
        .build()
        .unwrap_err();
    assert_eq!(
        err,
        ConfigError::NotWritable {
            port: "aligned".to_string(),
            protocol: "derived".to_string(),
        }
    );
}

#[test]
fn test_bound_format_must_match_port() {
    let fx = fixture();
    let err = TaskContext::builder("align", "aligner", &fx.inputs, &fx.outputs)
        .input("reads", fx.data("reads", "fasta", &["/data/r1.fa"]))
        .input("index", fx.index())
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::FormatMismatch { ref port, .. } if port == "reads"));
}

#[test]
fn test_cardinality_is_enforced() {
    let fx = fixture();

    let err = TaskContext::builder("align", "aligner", &fx.inputs, &fx.outputs)
        .input("reads", fx.data("reads", "fastq", &["/data/r1.fq", "/data/r2.fq"]))
        .input("index", fx.index())
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::Cardinality { actual: 2, .. }));

    let seven: Vec<String> = (1..=7).map(|i| format!("/ref/hg38.{}.bt2", i)).collect();
    let seven: Vec<&str> = seven.iter().map(String::as_str).collect();
    let err = TaskContext::builder("align", "aligner", &fx.inputs, &fx.outputs)
        .input("reads", fx.data("reads", "fastq", &["/data/r1.fq"]))
        .input("index", fx.data("index", "bowtie-index", &seven))
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::Cardinality { actual: 7, .. }));

    let err = TaskContext::builder("align", "aligner", &fx.inputs, &fx.outputs)
        .input("reads", fx.data("reads", "fastq", &[]))
        .input("index", fx.index())
        .build()
        .unwrap_err();
    assert!(matches!(err, ConfigError::Cardinality { actual: 0, .. }));
}

#[test]
fn test_unknown_port_binding() {
    let fx = fixture();
    let err = TaskContext::builder("align", "aligner", &fx.inputs, &fx.outputs)
        .input("reads", fx.data("reads", "fastq", &["/data/r1.fq"]))
        .input("index", fx.index())
        .input("extra", fx.data("extra", "bed", &["/data/x.bed"]))
        .build()
        .unwrap_err();
    assert_eq!(err, ConfigError::PortNotFound("extra".to_string()));
}

#[test]
fn test_missing_output_binding() {
    let fx = fixture();
    let err = TaskContext::builder("align", "aligner", &fx.inputs, &fx.outputs)
        .input("reads", fx.data("reads", "fastq", &["/data/r1.fq"]))
        .input("index", fx.index())
        .build()
        .unwrap_err();
    assert_eq!(err, ConfigError::MissingBinding("aligned".to_string()));
}

#[tokio::test]
async fn test_context_carries_artifact_store() {
    use async_trait::async_trait;
    use pipecore::storage::get_or_compute;
    use pipecore::{ArtifactStore, DataFile, StorageKey};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded(Mutex<Vec<(String, DataFile)>>);

    #[async_trait]
    impl ArtifactStore for Recorded {
        async fn get(&self, key: &StorageKey) -> Option<DataFile> {
            let entries = self.0.lock().unwrap();
            entries.iter().find(|(k, _)| *k == key.fingerprint()).map(|(_, f)| f.clone())
        }

        async fn put(&self, key: &StorageKey, file: &DataFile) {
            self.0.lock().unwrap().push((key.fingerprint(), file.clone()));
        }
    }

    let fx = fixture();
    let bare = Ports::new();
    assert!(TaskContext::builder("index", "indexer", &bare, &bare)
        .build()
        .unwrap()
        .store()
        .is_none());

    let ctx = TaskContext::builder("index", "indexer", &bare, &bare)
        .store(Arc::new(Recorded::default()))
        .build()
        .unwrap();
    let store = ctx.store().unwrap();
    let key = StorageKey::new("samtools-faidx", "fp-hg38");

    let registry = &fx.registry;
    let built = get_or_compute(store, &key, || async move { registry.resolve("/ref/hg38.fa.fai") })
        .await
        .unwrap();
    let cached = get_or_compute(store, &key, || async {
        Err(pipecore::DataError::transport("/ref/hg38.fa.fai", "rebuilt despite cache"))
    })
    .await
    .unwrap();
    assert_eq!(cached.reference(), built.reference());
    assert!(format!("{:?}", ctx).contains("has_store: true"));
}
