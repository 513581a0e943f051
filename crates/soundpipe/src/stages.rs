//! Concrete stage invokers.
//!
//! Analyze, Generate, Execute, and Validate wrap collaborator commands;
//! Relocate is a local filesystem move. Compile nests the generic
//! pipeline driver over Generate/Execute/Validate and is atomic from the
//! outer pipeline's point of view.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use soundpipe_core::classify::{self, Classified, RelocateFault};
use soundpipe_core::{naming, ArtifactRef, CompileOutput, Recipe, StageName};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::collab::{Collaborator, InvokeError};
use crate::pipeline::{PipelineEngine, PipelineStatus};
use crate::stage::{Stage, StageFuture, StageOutcome};

/// Map a collaborator transport failure onto the stage taxonomy.
///
/// Timeouts, non-zero exits, and spawn failures are all transient faults
/// at the pipeline level.
fn transport_outcome(err: InvokeError) -> StageOutcome {
    match err {
        InvokeError::Cancelled => StageOutcome::Cancelled,
        other => StageOutcome::Retryable {
            message: other.to_string(),
        },
    }
}

fn classified_outcome(classified: Classified) -> StageOutcome {
    match classified {
        Classified::Success(payload) => StageOutcome::Success(payload),
        Classified::Retryable(message) => StageOutcome::Retryable { message },
    }
}

/// Analyze: sample stub in, synthesis recipe out.
#[derive(Debug)]
pub struct AnalyzeStage {
    collab: Collaborator,
}

impl AnalyzeStage {
    pub fn new(collab: Collaborator) -> Self {
        Self { collab }
    }
}

impl Stage for AnalyzeStage {
    fn name(&self) -> StageName {
        StageName::Analyze
    }

    fn invoke<'a>(&'a self, input: &'a str, cancel: &'a CancellationToken) -> StageFuture<'a> {
        Box::pin(async move {
            match self.collab.invoke(input, cancel).await {
                Ok(raw) => classified_outcome(classify::classify_analyze(&raw)),
                Err(err) => transport_outcome(err),
            }
        })
    }
}

/// Generate: recipe in, DSP source out.
#[derive(Debug)]
pub struct GenerateStage {
    collab: Collaborator,
}

impl GenerateStage {
    pub fn new(collab: Collaborator) -> Self {
        Self { collab }
    }
}

impl Stage for GenerateStage {
    fn name(&self) -> StageName {
        StageName::Generate
    }

    fn invoke<'a>(&'a self, input: &'a str, cancel: &'a CancellationToken) -> StageFuture<'a> {
        Box::pin(async move {
            match self.collab.invoke(input, cancel).await {
                Ok(raw) => classified_outcome(classify::classify_generate(&raw)),
                Err(err) => transport_outcome(err),
            }
        })
    }
}

/// Execute: DSP source in, rendered audio path out.
///
/// The reply path must exist on disk; an executor that claims success
/// without producing the file is a transient fault.
#[derive(Debug)]
pub struct ExecuteStage {
    collab: Collaborator,
}

impl ExecuteStage {
    pub fn new(collab: Collaborator) -> Self {
        Self { collab }
    }
}

impl Stage for ExecuteStage {
    fn name(&self) -> StageName {
        StageName::Execute
    }

    fn invoke<'a>(&'a self, input: &'a str, cancel: &'a CancellationToken) -> StageFuture<'a> {
        Box::pin(async move {
            let raw = match self.collab.invoke(input, cancel).await {
                Ok(raw) => raw,
                Err(err) => return transport_outcome(err),
            };
            match classify::classify_execute(&raw) {
                Classified::Success(path) => {
                    if Path::new(&path).is_file() {
                        StageOutcome::Success(path)
                    } else {
                        StageOutcome::Retryable {
                            message: format!("executor reported {path} but the file does not exist"),
                        }
                    }
                }
                Classified::Retryable(message) => StageOutcome::Retryable { message },
            }
        })
    }
}

/// Validate: rendered audio path in, same path out on success.
///
/// Runs the configured validator command with the path on stdin; exit 0
/// means the artifact passed. No validator configured means validation
/// passes through.
#[derive(Debug)]
pub struct ValidateStage {
    collab: Option<Collaborator>,
}

impl ValidateStage {
    pub fn new(collab: Option<Collaborator>) -> Self {
        Self { collab }
    }
}

impl Stage for ValidateStage {
    fn name(&self) -> StageName {
        StageName::Validate
    }

    fn invoke<'a>(&'a self, input: &'a str, cancel: &'a CancellationToken) -> StageFuture<'a> {
        Box::pin(async move {
            let Some(collab) = &self.collab else {
                debug!("no validator configured; passing artifact through");
                return StageOutcome::Success(input.to_string());
            };
            match collab.invoke(input, cancel).await {
                Ok(_) => StageOutcome::Success(input.to_string()),
                Err(err) => transport_outcome(err),
            }
        })
    }
}

/// Compile: recipe in, rendered-artifact envelope out.
///
/// Internally drives Generate → Execute → Validate with its own attempt
/// budget through the same pipeline engine. The inner retries do not
/// consume the outer budget; an exhausted inner pipeline surfaces as one
/// retryable outer failure.
pub struct CompileStage {
    engine: PipelineEngine,
    stages: Vec<Box<dyn Stage>>,
}

impl std::fmt::Debug for CompileStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileStage")
            .field("max_attempts", &self.engine.max_attempts())
            .finish_non_exhaustive()
    }
}

impl CompileStage {
    pub fn new(
        generator: Collaborator,
        executor: Collaborator,
        validator: Option<Collaborator>,
        max_attempts: u32,
    ) -> Self {
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(GenerateStage::new(generator)),
            Box::new(ExecuteStage::new(executor)),
            Box::new(ValidateStage::new(validator)),
        ];
        Self {
            engine: PipelineEngine::new(max_attempts),
            stages,
        }
    }
}

impl Stage for CompileStage {
    fn name(&self) -> StageName {
        StageName::Compile
    }

    fn invoke<'a>(&'a self, input: &'a str, cancel: &'a CancellationToken) -> StageFuture<'a> {
        Box::pin(async move {
            let recipe: Recipe = match serde_json::from_str(input) {
                Ok(recipe) => recipe,
                Err(e) => {
                    return StageOutcome::Retryable {
                        message: format!("compile input is not a recipe: {e}"),
                    };
                }
            };

            let outcome = self.engine.run(&self.stages, input, cancel).await;
            match outcome.status {
                PipelineStatus::Success { payload } => {
                    info!(
                        effect = %recipe.effect_name,
                        attempts = outcome.attempts,
                        "compile pipeline produced artifact"
                    );
                    let envelope = CompileOutput {
                        artifact_path: payload,
                        effect_name: recipe.effect_name,
                    };
                    match serde_json::to_string(&envelope) {
                        Ok(json) => StageOutcome::Success(json),
                        Err(e) => StageOutcome::Retryable {
                            message: format!("failed to encode compile output: {e}"),
                        },
                    }
                }
                PipelineStatus::Failed { stage } => {
                    // The log ends with the exhaustion record; the entry
                    // before it is the actual last failure.
                    let detail = outcome
                        .error_log
                        .iter()
                        .rev()
                        .nth(1)
                        .or_else(|| outcome.error_log.last())
                        .map_or("", String::as_str);
                    StageOutcome::Retryable {
                        message: format!(
                            "compile pipeline failed at {stage} after {} attempts: {detail}",
                            outcome.attempts
                        ),
                    }
                }
                PipelineStatus::Cancelled => StageOutcome::Cancelled,
            }
        })
    }
}

/// Relocate: move the rendered artifact to its final resting place and
/// checksum it.
///
/// A missing source is treated as a proxy for an upstream compile fault
/// (the artifact path may have gone stale); any other filesystem error is
/// terminal because retrying the same move cannot succeed.
#[derive(Debug)]
pub struct RelocateStage {
    dest_dir: PathBuf,
    sample_id: String,
}

impl RelocateStage {
    pub fn new(dest_dir: &Path, sample_id: impl Into<String>) -> Self {
        Self {
            dest_dir: dest_dir.to_path_buf(),
            sample_id: sample_id.into(),
        }
    }

    fn relocate(&self, envelope: &CompileOutput) -> Result<ArtifactRef, RelocateFault> {
        let source = Path::new(&envelope.artifact_path);
        let dest = self.dest_dir.join(naming::artifact_filename(
            &self.sample_id,
            &envelope.effect_name,
        ));

        move_file(source, &dest).map_err(|e| classify::classify_relocate(&e))?;
        let checksum = compute_checksum(&dest).map_err(|e| classify::classify_relocate(&e))?;

        Ok(ArtifactRef {
            path: dest,
            checksum,
        })
    }
}

impl Stage for RelocateStage {
    fn name(&self) -> StageName {
        StageName::Relocate
    }

    fn invoke<'a>(&'a self, input: &'a str, cancel: &'a CancellationToken) -> StageFuture<'a> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return StageOutcome::Cancelled;
            }

            let envelope: CompileOutput = match serde_json::from_str(input) {
                Ok(envelope) => envelope,
                Err(e) => {
                    return StageOutcome::Retryable {
                        message: format!("relocate input is not a compile payload: {e}"),
                    };
                }
            };

            match self.relocate(&envelope) {
                Ok(artifact) => {
                    info!(
                        sample_id = %self.sample_id,
                        path = %artifact.path.display(),
                        "artifact relocated"
                    );
                    match serde_json::to_string(&artifact) {
                        Ok(json) => StageOutcome::Success(json),
                        Err(e) => StageOutcome::Retryable {
                            message: format!("failed to encode artifact ref: {e}"),
                        },
                    }
                }
                Err(RelocateFault::MissingSource) => StageOutcome::RetryableUpstream {
                    stage: StageName::Compile,
                    message: format!("source artifact {} is missing", envelope.artifact_path),
                },
                Err(RelocateFault::Fatal(message)) => StageOutcome::Terminal { message },
            }
        })
    }
}

/// Move a file, falling back to copy+remove when rename fails but the
/// source still exists (cross-device moves).
fn move_file(source: &Path, dest: &Path) -> std::io::Result<()> {
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if !source.is_file() {
                return Err(rename_err);
            }
            fs::copy(source, dest)?;
            fs::remove_file(source)?;
            Ok(())
        }
    }
}

/// SHA-256 of file contents, lowercase hex.
fn compute_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const RECIPE_JSON: &str = r#"{"effect_name":"hull_groan","duration":4.0,"description":"Low metallic groan with a long resonant tail."}"#;

    fn collab(cmd: &str, dir: &Path) -> Collaborator {
        Collaborator::new(cmd, 10, dir)
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    // --- analyze ---

    #[tokio::test]
    async fn analyze_success_passes_recipe_through() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("recipe.json"), RECIPE_JSON).unwrap();
        let stage = AnalyzeStage::new(collab("cat recipe.json", dir.path()));

        match stage.invoke("{\"id\":\"A1\"}", &token()).await {
            StageOutcome::Success(payload) => {
                let recipe: Recipe = serde_json::from_str(&payload).unwrap();
                assert_eq!(recipe.effect_name, "hull_groan");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn analyze_error_reply_is_retryable() {
        let dir = TempDir::new().unwrap();
        let stage = AnalyzeStage::new(collab("echo 'ERROR: overloaded'", dir.path()));
        assert!(matches!(
            stage.invoke("{}", &token()).await,
            StageOutcome::Retryable { .. }
        ));
    }

    #[tokio::test]
    async fn analyze_nonzero_exit_is_retryable() {
        let dir = TempDir::new().unwrap();
        let stage = AnalyzeStage::new(collab("exit 2", dir.path()));
        assert!(matches!(
            stage.invoke("{}", &token()).await,
            StageOutcome::Retryable { .. }
        ));
    }

    // --- execute ---

    #[tokio::test]
    async fn execute_requires_file_to_exist() {
        let dir = TempDir::new().unwrap();
        let stage = ExecuteStage::new(collab("echo /nonexistent/file.wav", dir.path()));
        match stage.invoke("code", &token()).await {
            StageOutcome::Retryable { message } => {
                assert!(message.contains("does not exist"));
            }
            other => panic!("expected retryable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_success_returns_path() {
        let dir = TempDir::new().unwrap();
        let wav = dir.path().join("out.wav");
        std::fs::write(&wav, b"fake audio").unwrap();
        let cmd = format!("echo {}", wav.display());
        let stage = ExecuteStage::new(collab(&cmd, dir.path()));

        match stage.invoke("code", &token()).await {
            StageOutcome::Success(path) => assert_eq!(path, wav.display().to_string()),
            other => panic!("expected success, got {other:?}"),
        }
    }

    // --- validate ---

    #[tokio::test]
    async fn validate_passes_through_without_validator() {
        let stage = ValidateStage::new(None);
        assert_eq!(
            stage.invoke("/tmp/a.wav", &token()).await,
            StageOutcome::Success("/tmp/a.wav".to_string())
        );
    }

    #[tokio::test]
    async fn validate_failure_is_retryable() {
        let dir = TempDir::new().unwrap();
        let stage = ValidateStage::new(Some(collab("echo 'too quiet' >&2; exit 1", dir.path())));
        match stage.invoke("/tmp/a.wav", &token()).await {
            StageOutcome::Retryable { message } => assert!(message.contains("too quiet")),
            other => panic!("expected retryable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn validate_success_preserves_path() {
        let dir = TempDir::new().unwrap();
        let stage = ValidateStage::new(Some(collab("exit 0", dir.path())));
        assert_eq!(
            stage.invoke("/tmp/a.wav", &token()).await,
            StageOutcome::Success("/tmp/a.wav".to_string())
        );
    }

    // --- compile ---

    #[tokio::test]
    async fn compile_runs_inner_pipeline_to_success() {
        let dir = TempDir::new().unwrap();
        let wav = dir.path().join("rendered.wav");
        std::fs::write(&wav, b"fake audio").unwrap();

        let generator = collab("echo 'let w = sine(440.0);'", dir.path());
        let executor = collab(&format!("echo {}", wav.display()), dir.path());
        let stage = CompileStage::new(generator, executor, None, 10);

        match stage.invoke(RECIPE_JSON, &token()).await {
            StageOutcome::Success(payload) => {
                let envelope: CompileOutput = serde_json::from_str(&payload).unwrap();
                assert_eq!(envelope.effect_name, "hull_groan");
                assert_eq!(envelope.artifact_path, wav.display().to_string());
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn compile_exhaustion_is_one_retryable_outer_failure() {
        let dir = TempDir::new().unwrap();
        let generator = collab("echo 'ERROR: no tokens'", dir.path());
        let executor = collab("echo unused", dir.path());
        let stage = CompileStage::new(generator, executor, None, 2);

        match stage.invoke(RECIPE_JSON, &token()).await {
            StageOutcome::Retryable { message } => {
                assert!(message.contains("failed at generate"));
                assert!(message.contains("after 2 attempts"));
            }
            other => panic!("expected retryable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn compile_rejects_non_recipe_input() {
        let dir = TempDir::new().unwrap();
        let stage = CompileStage::new(
            collab("cat", dir.path()),
            collab("cat", dir.path()),
            None,
            2,
        );
        assert!(matches!(
            stage.invoke("not json", &token()).await,
            StageOutcome::Retryable { .. }
        ));
    }

    // --- relocate ---

    fn envelope(path: &Path) -> String {
        serde_json::to_string(&CompileOutput {
            artifact_path: path.display().to_string(),
            effect_name: "hull groan".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn relocate_moves_and_checksums() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("tmp.wav");
        std::fs::write(&src, b"fake audio").unwrap();
        let dest_dir = dir.path().join("final");
        std::fs::create_dir_all(&dest_dir).unwrap();

        let stage = RelocateStage::new(&dest_dir, "L1.1");
        match stage.invoke(&envelope(&src), &token()).await {
            StageOutcome::Success(payload) => {
                let artifact: ArtifactRef = serde_json::from_str(&payload).unwrap();
                assert_eq!(artifact.path, dest_dir.join("L1.1_hull_groan.wav"));
                assert!(artifact.path.exists());
                assert!(!src.exists());
                assert_eq!(artifact.checksum.len(), 64);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relocate_missing_source_is_attributed_to_compile() {
        let dir = TempDir::new().unwrap();
        let dest_dir = dir.path().join("final");
        std::fs::create_dir_all(&dest_dir).unwrap();

        let stage = RelocateStage::new(&dest_dir, "L1.1");
        let missing = dir.path().join("gone.wav");
        match stage.invoke(&envelope(&missing), &token()).await {
            StageOutcome::RetryableUpstream { stage, message } => {
                assert_eq!(stage, StageName::Compile);
                assert!(message.contains("missing"));
            }
            other => panic!("expected upstream retryable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relocate_unwritable_destination_is_terminal() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("tmp.wav");
        std::fs::write(&src, b"fake audio").unwrap();

        // Destination "directory" is actually a file, so the move can
        // never succeed no matter how often it is retried.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let dest_dir = blocker.join("final");

        let stage = RelocateStage::new(&dest_dir, "L1.1");
        match stage.invoke(&envelope(&src), &token()).await {
            StageOutcome::Terminal { .. } => {}
            other => panic!("expected terminal, got {other:?}"),
        }
        // The source survives a failed relocation.
        assert!(src.exists());
    }

    #[tokio::test]
    async fn move_file_falls_back_to_copy() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.txt");
        let dest = dir.path().join("b.txt");
        std::fs::write(&src, b"contents").unwrap();

        move_file(&src, &dest).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"contents");
    }

    #[test]
    fn checksum_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, b"abc").unwrap();
        let sum = compute_checksum(&path).unwrap();
        assert_eq!(
            sum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
