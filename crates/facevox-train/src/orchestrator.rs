//! Training orchestrator driving the adversarial update loop.
//!
//! Per mini-batch the state machine runs
//! `UpdateDiscriminator × n_critic → UpdateGenerator × n_gen → Logged`,
//! then either continues, checkpoints at the end of an epoch, or finishes.
//! Parameters are owned by the [`Trainer`]; everything that changes from
//! batch to batch lives in an explicit [`TrainingState`].

use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use facevox_core::{Error, Network, NormalizationStats, Result};
use facevox_model::{
    class_targets, classification_loss, discriminator_accuracy, distance_preservation, one_hot, scalar, AdversarialLoss,
    Discriminator, GradientPenalty, Generator,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::checkpoint::CheckpointStore;
use crate::config::{TrainingConfig, WASSERSTEIN_CRITIC_STEPS};
use crate::data::{Batch, DataSource};
use crate::gate::{AccuracyGate, GateDecision};
use crate::history::{Metric, TrainingHistory};
use crate::options::{compose, LossTerm};

/// Weight-clipping bound under the Wasserstein loss without penalty
pub const CLIP_VALUE: f64 = 0.01;

/// Where the orchestrator is in the per-batch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    UpdateDiscriminator { step: usize },
    UpdateGenerator { step: usize },
    Logged,
    Checkpoint { epoch: usize },
    Done,
}

/// Mutable run state, threaded through every phase
#[derive(Debug, Clone)]
pub struct TrainingState {
    pub history: TrainingHistory,
    /// Next epoch to run
    pub epoch: usize,
    pub phase: Phase,
    rng: StdRng,
}

impl TrainingState {
    /// State of a run that has not trained yet
    pub fn fresh(config: &TrainingConfig) -> Self {
        Self::resumed(config, TrainingHistory::new(&config.loss_options))
    }

    /// State continuing from a restored history
    pub fn resumed(config: &TrainingConfig, history: TrainingHistory) -> Self {
        let epoch = history.epochs_completed();
        Self {
            history,
            epoch,
            phase: Phase::Idle,
            rng: StdRng::seed_from_u64(config.seed.wrapping_add(epoch as u64)),
        }
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "phase");
        self.phase = phase;
    }
}

/// Result of a completed run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub run_id: String,
    pub epochs_completed: usize,
    pub batches: usize,
    pub discriminator_steps: usize,
    /// Discriminator updates withheld by the accuracy gate
    pub skipped_discriminator_steps: usize,
    pub final_d_loss: Option<f64>,
    pub final_g_loss: Option<f64>,
    /// Seconds spent in this invocation
    pub total_time: f64,
}

/// Inputs drawn once per mini-batch and shared by both phases
struct Conditioning {
    noise: Tensor,
    random_pcode: Tensor,
    true_pcode: Tensor,
    id_targets: Tensor,
    pcode_targets: Tensor,
}

#[derive(Debug, Clone, Copy, Default)]
struct DiscriminatorReport {
    loss: f64,
    accuracy: f64,
    gate: Option<GateDecision>,
    steps: usize,
    skipped: usize,
}

pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    generator: Generator,
    discriminator: Discriminator,
    g_vars: VarMap,
    d_vars: VarMap,
    g_opt: AdamW,
    d_opt: AdamW,
    adversarial: AdversarialLoss,
    penalty: Option<GradientPenalty>,
    gate: AccuracyGate,
    checkpoints: Option<CheckpointStore>,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device.device()?;

        let g_vars = VarMap::new();
        let d_vars = VarMap::new();
        let generator = Generator::new(
            config.model.generator(),
            VarBuilder::from_varmap(&g_vars, DType::F32, &device),
        )?;
        let discriminator = Discriminator::new(
            config.model.discriminator(),
            VarBuilder::from_varmap(&d_vars, DType::F32, &device),
        )?;

        let opt = &config.optimizer;
        let params = |lr: f64| ParamsAdamW {
            lr,
            beta1: opt.beta1,
            beta2: opt.beta2,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let g_opt = AdamW::new(g_vars.all_vars(), params(opt.lr_g))?;
        let d_opt = AdamW::new(d_vars.all_vars(), params(opt.lr_d))?;

        if config.loss_options.wasserstein() && config.n_critic != WASSERSTEIN_CRITIC_STEPS {
            tracing::info!(
                configured = config.n_critic,
                effective = WASSERSTEIN_CRITIC_STEPS,
                "wasserstein loss overrides n_critic"
            );
        }

        let checkpoints = config
            .checkpoint_dir
            .as_ref()
            .map(|dir| CheckpointStore::new(dir.clone(), config.run_id()));

        tracing::info!(
            run = %config.run_id(),
            options = %config.loss_options.tag(),
            resolution = config.model.resolution,
            "trainer ready"
        );

        Ok(Self {
            adversarial: AdversarialLoss::new(config.loss_options.wasserstein()),
            penalty: config.loss_options.penalty().map(GradientPenalty::new),
            gate: AccuracyGate::new(config.n_dacc_avg),
            config,
            device,
            generator,
            discriminator,
            g_vars,
            d_vars,
            g_opt,
            d_opt,
            checkpoints,
        })
    }

    /// Restore from the run's checkpoint when one exists, else start fresh
    pub fn initial_state(&mut self) -> Result<TrainingState> {
        match &self.checkpoints {
            Some(store) if store.exists() => {
                let history = store.load(&mut self.g_vars, &mut self.d_vars, &self.config.loss_options)?;
                let state = TrainingState::resumed(&self.config, history);
                tracing::info!(epoch = state.epoch + 1, "resuming training");
                Ok(state)
            }
            _ => Ok(TrainingState::fresh(&self.config)),
        }
    }

    /// Run the remaining epochs of `state` over `data`
    pub fn run<D: DataSource + ?Sized>(
        &mut self,
        data: &D,
        mut state: TrainingState,
    ) -> Result<(TrainingState, TrainingSummary)> {
        let num_batches = data.num_batches();
        if num_batches == 0 {
            return Err(Error::InvalidInput("data source yields no complete mini-batch".to_string()));
        }
        let stats = data.normalization();
        let start = Instant::now();
        let mut summary = TrainingSummary {
            run_id: self.config.run_id(),
            epochs_completed: state.epoch,
            batches: 0,
            discriminator_steps: 0,
            skipped_discriminator_steps: 0,
            final_d_loss: None,
            final_g_loss: None,
            total_time: 0.0,
        };

        tracing::info!(
            run = %summary.run_id,
            from_epoch = state.epoch + 1,
            epochs = self.config.epochs,
            num_batches,
            "training start"
        );

        for epoch in state.epoch..self.config.epochs {
            let epoch_start = Instant::now();
            for index in 0..num_batches {
                let batch = data.batch(epoch, index)?;
                let d_report = self.train_batch(&mut state, &batch, &stats)?;

                summary.batches += 1;
                summary.discriminator_steps += d_report.steps;
                summary.skipped_discriminator_steps += d_report.skipped;
                state.enter(Phase::Logged);

                if (index + 1) % self.config.log_every.max(1) == 0 {
                    let secs = start.elapsed().as_secs();
                    tracing::info!(
                        "{:2}h{:2}m E[{:2}] B[{}/{}] D: {:.4}, G: {:.4}, D_acc: {:.4}/{:.4}",
                        secs / 3600,
                        secs / 60 % 60,
                        epoch + 1,
                        index + 1,
                        num_batches,
                        d_report.loss,
                        state.history.last(Metric::GLoss).unwrap_or(f64::NAN),
                        d_report.accuracy,
                        d_report.gate.map_or(f64::NAN, |g| g.trailing_accuracy),
                    );
                }
            }

            state.history.push(Metric::PerEpochTime, epoch_start.elapsed().as_secs_f64())?;
            state.epoch = epoch + 1;
            summary.epochs_completed = state.epoch;
            state.enter(Phase::Checkpoint { epoch: state.epoch });
            self.checkpoint(&state)?;
            tracing::info!(epoch = epoch + 1, seconds = epoch_start.elapsed().as_secs_f64(), "epoch finished");
        }

        summary.total_time = start.elapsed().as_secs_f64();
        state.history.push(Metric::TotalTime, summary.total_time)?;
        summary.final_d_loss = state.history.last(Metric::DLoss);
        summary.final_g_loss = state.history.last(Metric::GLoss);
        self.checkpoint(&state)?;
        state.enter(Phase::Done);

        tracing::info!(
            run = %summary.run_id,
            epochs = summary.epochs_completed,
            total_time = summary.total_time,
            skipped_discriminator_steps = summary.skipped_discriminator_steps,
            "training finished"
        );
        Ok((state, summary))
    }

    /// Convenience: restore or start fresh, then run to completion
    pub fn train<D: DataSource + ?Sized>(&mut self, data: &D) -> Result<TrainingSummary> {
        let state = self.initial_state()?;
        let (_, summary) = self.run(data, state)?;
        Ok(summary)
    }

    fn checkpoint(&self, state: &TrainingState) -> Result<()> {
        if let Some(store) = &self.checkpoints {
            store.save(&self.g_vars, &self.d_vars, &state.history, state.epoch)?;
        }
        Ok(())
    }

    fn train_batch(
        &mut self,
        state: &mut TrainingState,
        batch: &Batch,
        stats: &NormalizationStats,
    ) -> Result<DiscriminatorReport> {
        let conditioning = self.condition(state, batch)?;
        let report = self.update_discriminator(state, batch, &conditioning)?;
        self.update_generator(state, batch, &conditioning, stats)?;
        Ok(report)
    }

    fn condition(&self, state: &mut TrainingState, batch: &Batch) -> Result<Conditioning> {
        let dims = &self.config.model;
        let b = batch.len();

        let ids = batch.ids();
        if let Some(&id) = ids.iter().find(|&&id| id >= dims.n_id) {
            return Err(Error::InvalidInput(format!("identity label {} outside [0, {})", id, dims.n_id)));
        }
        let pcodes = batch.pcodes();
        let random: Vec<usize> = (0..b).map(|_| state.rng.gen_range(0..dims.n_pcode)).collect();
        let noise: Vec<f32> = (0..b * dims.n_noise).map(|_| state.rng.gen::<f32>()).collect();

        Ok(Conditioning {
            noise: Tensor::from_vec(noise, (b, dims.n_noise), &self.device)?,
            random_pcode: one_hot(&random, dims.n_pcode, &self.device)?,
            true_pcode: one_hot(&pcodes, dims.n_pcode, &self.device)?,
            id_targets: class_targets(&ids, &self.device)?,
            pcode_targets: class_targets(&pcodes, &self.device)?,
        })
    }

    fn update_discriminator(
        &mut self,
        state: &mut TrainingState,
        batch: &Batch,
        cond: &Conditioning,
    ) -> Result<DiscriminatorReport> {
        let mut report = DiscriminatorReport::default();

        for step in 0..self.config.effective_n_critic() {
            state.enter(Phase::UpdateDiscriminator { step });

            let real = self.discriminator.discriminate(&batch.volumes, true)?;
            let gan_real = self.adversarial.real(&real.realism)?;
            let id = classification_loss(&real.identity_logits, &cond.id_targets)?;
            let pcode = classification_loss(&real.pcode_logits, &cond.pcode_targets)?;

            let fake_volumes = self
                .generator
                .generate(&batch.images, &cond.random_pcode, &cond.noise, true)?
                .detach();
            let fake = self.discriminator.discriminate(&fake_volumes, true)?;
            let gan_fake = self.adversarial.fake(&fake.realism)?;

            let accuracy = f64::from(discriminator_accuracy(&real.realism, &fake.realism)?);

            let penalty = match &self.penalty {
                Some(penalty) => {
                    let interpolant = penalty.interpolate(&batch.volumes, &fake_volumes)?;
                    let discriminator = &self.discriminator;
                    Some(penalty.compute(&interpolant, |x| discriminator.realism(x, true))?)
                }
                None => None,
            };

            let mut terms = vec![
                (LossTerm::GanReal, &gan_real),
                (LossTerm::Id, &id),
                (LossTerm::PCode, &pcode),
                (LossTerm::GanFake, &gan_fake),
            ];
            if let Some(gp) = &penalty {
                terms.push((LossTerm::GradientPenalty, gp));
            }
            let loss = compose(&self.config.loss_options, &terms)?;
            let loss_value = finite(Network::Discriminator, "D_loss", &loss)?;

            if step == 0 {
                let history = &mut state.history;
                history.push(Metric::DLoss, loss_value)?;
                history.push(Metric::DLossGanReal, f64::from(scalar(&gan_real)?))?;
                history.push(Metric::DLossId, f64::from(scalar(&id)?))?;
                history.push(Metric::DLossPCode, f64::from(scalar(&pcode)?))?;
                history.push(Metric::DLossGanFake, f64::from(scalar(&gan_fake)?))?;
                if let Some(gp) = &penalty {
                    history.push(Metric::DLossGp, f64::from(scalar(gp)?))?;
                }
                history.push(Metric::DAcc, accuracy)?;
                report.loss = loss_value;
                report.accuracy = accuracy;
            }

            let decision = self
                .gate
                .evaluate(state.history.column(Metric::DAcc).unwrap_or_default());
            tracing::debug!(
                step,
                trailing_accuracy = decision.trailing_accuracy,
                update = decision.step,
                "discriminator gate"
            );
            if decision.step {
                self.d_opt.backward_step(&loss)?;
                report.steps += 1;
            } else {
                report.skipped += 1;
            }
            report.gate = Some(decision);

            if self.config.loss_options.clips_weights() {
                clip_weights(&self.d_vars, CLIP_VALUE)?;
            }
        }

        Ok(report)
    }

    fn update_generator(
        &mut self,
        state: &mut TrainingState,
        batch: &Batch,
        cond: &Conditioning,
        stats: &NormalizationStats,
    ) -> Result<()> {
        let options = &self.config.loss_options;

        for step in 0..self.config.n_gen {
            state.enter(Phase::UpdateGenerator { step });

            let fake_volumes = self
                .generator
                .generate(&batch.images, &cond.true_pcode, &cond.noise, true)?;
            let fake = self.discriminator.discriminate(&fake_volumes, true)?;

            let gan = self.adversarial.generator(&fake.realism)?;
            let id = classification_loss(&fake.identity_logits, &cond.id_targets)?;
            let pcode = classification_loss(&fake.pcode_logits, &cond.pcode_targets)?;
            let recon = match options.reconstruction() {
                Some(criterion) => Some(criterion.loss(&fake_volumes, &batch.volumes)?),
                None => None,
            };
            let distance = if LossTerm::Distance.enabled(options) {
                Some(distance_preservation(&batch.images, &fake_volumes, stats)?)
            } else {
                None
            };

            let mut terms = vec![(LossTerm::GanFake, &gan), (LossTerm::Id, &id), (LossTerm::PCode, &pcode)];
            if let Some(recon) = &recon {
                terms.push((LossTerm::Recon, recon));
            }
            if let Some(distance) = &distance {
                terms.push((LossTerm::Distance, distance));
            }
            let loss = compose(options, &terms)?;
            let loss_value = finite(Network::Generator, "G_loss", &loss)?;

            if step == 0 {
                let history = &mut state.history;
                history.push(Metric::GLoss, loss_value)?;
                history.push(Metric::GLossGanFake, f64::from(scalar(&gan)?))?;
                history.push(Metric::GLossId, f64::from(scalar(&id)?))?;
                history.push(Metric::GLossPCode, f64::from(scalar(&pcode)?))?;
                if let Some(recon) = &recon {
                    history.push(Metric::GLossRecon, f64::from(scalar(recon)?))?;
                }
                if let Some(distance) = &distance {
                    history.push(Metric::GLossDist, f64::from(scalar(distance)?))?;
                }
            }

            self.g_opt.backward_step(&loss)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    pub fn generator_vars(&self) -> &VarMap {
        &self.g_vars
    }

    pub fn discriminator_vars(&self) -> &VarMap {
        &self.d_vars
    }

    pub fn checkpoints(&self) -> Option<&CheckpointStore> {
        self.checkpoints.as_ref()
    }
}

/// Scalar value of `loss`, or `OptimizerDivergence` when it is not finite
fn finite(network: Network, metric: &str, loss: &Tensor) -> Result<f64> {
    let value = scalar(loss)?;
    if !value.is_finite() {
        return Err(Error::OptimizerDivergence {
            network,
            metric: metric.to_string(),
            value,
        });
    }
    Ok(f64::from(value))
}

/// Batch-norm running statistics are buffers, not weights
pub fn is_running_stat(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}

/// Clamp every trainable variable of `varmap` to `[-c, c]`
pub fn clip_weights(varmap: &VarMap, c: f64) -> Result<()> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|e| Error::InvalidInput(format!("parameter map unavailable: {}", e)))?;
    for (name, var) in vars.iter() {
        if is_running_stat(name) {
            continue;
        }
        var.set(&var.as_tensor().clamp(-c, c)?)?;
    }
    Ok(())
}
