use std::sync::Arc;

use anyhow::{bail, Context, Result};
use keepsake_contracts::events::{Notifier, TaskEvent};
use keepsake_contracts::progress::{progress_at, Stage};
use keepsake_contracts::tasks::{TaskRegistry, TaskResult, TaskUpdate};
use tracing::{info, warn};

use crate::compose;
use crate::generate::ImageGenerator;
use crate::store::{ArtifactStore, UploadedImage};
use crate::truncate_text;
use crate::vision::SceneAnalyzer;

/// Hard cap on logo generation attempts in the verification loop.
pub const MAX_LOGO_ATTEMPTS: u32 = 3;
/// Independent redesign candidates produced in variants mode.
pub const VARIANT_COUNT: usize = 3;

/// Pipeline mode, fixed at submission time by the task's `style` option.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Card,
    Variants,
}

impl Mode {
    pub fn from_style(style: &str) -> Self {
        match style.trim().to_ascii_lowercase().as_str() {
            "variants" | "redesign" => Mode::Variants,
            _ => Mode::Card,
        }
    }
}

/// Outcome of the bounded caption-verification loop.
pub enum LogoOutcome {
    Approved { bytes: Vec<u8>, attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Drives one task from `processing` to a terminal state.
///
/// Stages run strictly sequentially; every advance writes the registry and
/// publishes the fresh snapshot before the next stage starts. All I/O here
/// is blocking; the server runs each pipeline on a blocking worker.
pub struct Pipeline {
    analyzer: Arc<dyn SceneAnalyzer>,
    generator: Arc<dyn ImageGenerator>,
    registry: Arc<TaskRegistry>,
    notifier: Notifier,
    artifacts: ArtifactStore,
    card_caption: String,
}

impl Pipeline {
    pub fn new(
        analyzer: Arc<dyn SceneAnalyzer>,
        generator: Arc<dyn ImageGenerator>,
        registry: Arc<TaskRegistry>,
        notifier: Notifier,
        artifacts: ArtifactStore,
        card_caption: impl Into<String>,
    ) -> Self {
        Self {
            analyzer,
            generator,
            registry,
            notifier,
            artifacts,
            card_caption: card_caption.into(),
        }
    }

    /// Runs the whole pipeline for one task. The uploaded photo is removed
    /// exactly once on every exit path, after the terminal state is decided.
    pub fn run(&self, task_id: &str, upload: UploadedImage) {
        let Some(task) = self.registry.get(task_id) else {
            warn!(task_id, "pipeline started for unknown task");
            upload.remove();
            return;
        };
        let mode = Mode::from_style(&task.style);
        info!(task_id, ?mode, "pipeline started");

        let outcome = match mode {
            Mode::Card => self.run_card(task_id, &upload),
            Mode::Variants => self.run_variants(task_id, &upload),
        };

        match outcome {
            Ok(result) => {
                if let Some(task) = self
                    .registry
                    .update(task_id, TaskUpdate::completed(result.clone()))
                {
                    self.notifier.publish(TaskEvent::update_from(&task));
                }
                self.notifier.publish(TaskEvent::result_ready(task_id, &result));
                info!(task_id, "pipeline completed");
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(task_id, error = %message, "pipeline failed");
                if let Some(task) = self.registry.update(task_id, TaskUpdate::failed(message)) {
                    self.notifier.publish(TaskEvent::update_from(&task));
                }
            }
        }

        upload.remove();
    }

    fn advance(&self, task_id: &str, stage: Stage, fraction: f32) {
        let update = TaskUpdate::stage(stage.status(), progress_at(stage, fraction));
        if let Some(task) = self.registry.update(task_id, update) {
            self.notifier.publish(TaskEvent::update_from(&task));
        }
    }

    fn run_variants(&self, task_id: &str, upload: &UploadedImage) -> Result<TaskResult> {
        self.advance(task_id, Stage::Analyzing, 0.0);
        let photo = upload.read()?;
        let description = self
            .analyzer
            .describe(&photo, upload.mime())
            .context("photo analysis failed")?;
        self.notifier.log(
            task_id,
            format!("photo analyzed: {}", truncate_text(&description, 200)),
        );
        self.advance(task_id, Stage::Analyzing, 1.0);

        let prompt = variant_prompt(&description);
        let mut variants = Vec::with_capacity(VARIANT_COUNT);
        for idx in 0..VARIANT_COUNT {
            self.advance(
                task_id,
                Stage::ApplyingStyle,
                idx as f32 / VARIANT_COUNT as f32,
            );
            let url = self
                .generator
                .generate(&prompt)
                .with_context(|| format!("variant {} generation failed", idx + 1))?;
            variants.push(url);
        }
        self.advance(task_id, Stage::ApplyingStyle, 1.0);
        Ok(TaskResult::Variants { variants })
    }

    fn run_card(&self, task_id: &str, upload: &UploadedImage) -> Result<TaskResult> {
        // The photo is decoded up front, before any generation spend.
        self.advance(task_id, Stage::Analyzing, 0.0);
        let photo = compose::decode(&upload.read()?).context("uploaded photo is not a valid image")?;
        self.advance(task_id, Stage::Analyzing, 1.0);

        self.advance(task_id, Stage::GeneratingLogo, 0.0);
        let logo_bytes = match self.generate_verified_logo(task_id)? {
            LogoOutcome::Approved { bytes, attempts } => {
                self.notifier
                    .log(task_id, format!("logo approved on attempt {attempts}"));
                bytes
            }
            LogoOutcome::Exhausted { attempts } => bail!(
                "logo caption \"{}\" was not legible after {attempts} attempts",
                self.card_caption
            ),
        };
        self.advance(task_id, Stage::GeneratingLogo, 1.0);

        self.advance(task_id, Stage::CreatingCard, 0.0);
        let logo = compose::decode(&logo_bytes).context("generated logo could not be decoded")?;
        let card = compose::compose_card(&photo, &logo)?;
        self.advance(task_id, Stage::CreatingCard, 1.0);

        self.advance(task_id, Stage::Persisting, 0.0);
        let encoded = compose::encode_png(&card)?;
        let card_url = self
            .artifacts
            .save_png(&format!("{task_id}-card.png"), &encoded)?;
        self.advance(task_id, Stage::Persisting, 1.0);
        Ok(TaskResult::Card { card_url })
    }

    /// Generate-then-verify loop: at most `MAX_LOGO_ATTEMPTS` generation
    /// calls, a tagged outcome, never an implicit retry through recursion.
    fn generate_verified_logo(&self, task_id: &str) -> Result<LogoOutcome> {
        let prompt = logo_prompt(&self.card_caption);
        let mut attempts = 0;
        while attempts < MAX_LOGO_ATTEMPTS {
            attempts += 1;
            self.advance(
                task_id,
                Stage::GeneratingLogo,
                (attempts - 1) as f32 / MAX_LOGO_ATTEMPTS as f32,
            );
            let url = self
                .generator
                .generate(&prompt)
                .with_context(|| format!("logo generation attempt {attempts} failed"))?;
            let bytes = self.generator.fetch(&url)?;
            if self
                .analyzer
                .caption_visible(&bytes, "image/png", &self.card_caption)?
            {
                return Ok(LogoOutcome::Approved { bytes, attempts });
            }
            self.notifier.log(
                task_id,
                format!("logo attempt {attempts}: caption not legible"),
            );
        }
        Ok(LogoOutcome::Exhausted {
            attempts: MAX_LOGO_ATTEMPTS,
        })
    }
}

fn variant_prompt(description: &str) -> String {
    format!(
        "Interior redesign of the following room: {description}. Keep the room's \
layout and architecture, refresh the furnishing, palette, and decor. \
Photorealistic, natural lighting, no people, no text."
    )
}

fn logo_prompt(caption: &str) -> String {
    format!(
        "A bright festive round logo with the exact text \"{caption}\" in bold \
legible lettering, confetti and streamers, flat solid background color, \
centered composition."
    )
}
