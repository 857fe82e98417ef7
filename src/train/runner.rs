use std::sync::atomic::Ordering;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::buffer::{DataType, FrameBuffer};
use crate::error::Result;
use crate::loss::{LossFunction, LossType};
use crate::metrics::{MetricsCategoricalAccuracy, MetricsFunction};
use crate::model::ModelRef;
use crate::optim::Optimizer;
use crate::train::data::TrainData;
use crate::train::epoch_stats::EpochStats;
use crate::train::train_config::TrainConfig;

/// Drives mini-batch training of a model graph.
///
/// The runner owns the loss, the metric and the optimizer; the network is a
/// shared handle so callers can keep inspecting it between runs. The loss is
/// chosen per run by `TrainConfig`.
pub struct Runner {
    name: String,
    net: ModelRef,
    loss: Box<dyn LossFunction>,
    metrics: Box<dyn MetricsFunction>,
    optimizer: Box<dyn Optimizer>,
}

impl Runner {
    pub fn new(name: &str, net: ModelRef, optimizer: Box<dyn Optimizer>) -> Runner {
        Runner {
            name: name.to_string(),
            net,
            loss: LossType::default().create(),
            metrics: Box::new(MetricsCategoricalAccuracy::new()),
            optimizer,
        }
    }

    pub fn with_metrics(mut self, metrics: Box<dyn MetricsFunction>) -> Runner {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn net(&self) -> ModelRef {
        self.net.clone()
    }

    /// Trains for `config.spec.epochs` epochs and returns the statistics of
    /// the last completed epoch.
    ///
    /// # Early termination
    /// The loop ends early when the `progress_tx` receiver has been dropped
    /// or `config.stop_flag` is set.
    ///
    /// # Panics
    /// Panics if the training split is empty or `batch_size == 0`.
    pub fn fitting(&mut self, data: &TrainData, config: &TrainConfig) -> Result<Option<EpochStats>> {
        data.validate();
        assert!(!data.x_train.is_empty(), "training split must not be empty");
        assert!(config.spec.batch_size > 0, "batch_size must be at least 1");

        self.loss = config.spec.loss_type.create();
        let output_shape = self.net.borrow_mut().set_input_shape(&data.x_shape);
        log::debug!("{}: network {:?} -> {:?}", self.name, data.x_shape, output_shape);
        {
            let net = self.net.borrow();
            self.optimizer.set_variables(net.get_parameters(), net.get_gradients());
        }

        let mut rng = StdRng::seed_from_u64(config.spec.seed);
        let mut indices: Vec<usize> = (0..data.x_train.len()).collect();
        let mut last = None;

        for epoch in 1..=config.spec.epochs {
            if stop_requested(config) {
                break;
            }
            let t_start = Instant::now();

            self.loss.clear();
            self.metrics.clear();
            indices.shuffle(&mut rng);
            for batch in indices.chunks(config.spec.batch_size) {
                let x = FrameBuffer::from_samples(&data.x_train, batch, &data.x_shape, DataType::Fp32);
                let t = FrameBuffer::from_samples(&data.t_train, batch, &data.t_shape, DataType::Fp32);

                let y = self.net.borrow_mut().forward(x, true);
                let dy = self.loss.calculate_loss(&y, &t);
                self.metrics.calculate_metrics(&y, &t);
                self.net.borrow_mut().backward(dy);
                self.optimizer.update();
                self.net.borrow_mut().after_update();
            }
            let train_loss = self.loss.get_loss();
            let train_accuracy = self.metrics.get_metrics();

            let (test_loss, test_accuracy) = if data.x_test.is_empty() {
                (None, None)
            } else {
                let (loss, metric) = self.evaluate_split(
                    &data.x_test,
                    &data.t_test,
                    &data.x_shape,
                    &data.t_shape,
                    config.spec.batch_size,
                );
                (Some(loss), Some(metric))
            };

            let stats = EpochStats {
                epoch,
                total_epochs: config.spec.epochs,
                train_loss,
                train_accuracy,
                test_loss,
                test_accuracy,
                elapsed_ms: t_start.elapsed().as_millis() as u64,
            };
            log::info!(
                "{}: epoch {}/{} loss {:.5} {} {:.4}{}",
                self.name,
                epoch,
                config.spec.epochs,
                train_loss,
                self.metrics.metrics_string(),
                train_accuracy,
                match (test_loss, test_accuracy) {
                    (Some(l), Some(a)) => format!(" | test loss {l:.5} {} {a:.4}", self.metrics.metrics_string()),
                    _ => String::new(),
                }
            );

            if config.spec.file_write {
                self.net.borrow().save_binary(&format!("{}.bin", self.name))?;
            }

            last = Some(stats.clone());
            if let Some(tx) = &config.progress_tx {
                if tx.send(stats).is_err() {
                    break;
                }
            }
        }
        Ok(last)
    }

    /// Runs inference over `x` in batches and returns `(loss, metric)`.
    ///
    /// The loss is the one of the last `fitting` run, mean squared error
    /// before the first.
    ///
    /// Sample shapes are taken from the network's current input and output
    /// shapes, so the network must have been shaped first.
    pub fn evaluation(&mut self, x: &[Vec<f32>], t: &[Vec<f32>], batch_size: usize) -> (f64, f64) {
        let (x_shape, t_shape) = {
            let net = self.net.borrow();
            (net.input_shape(), net.output_shape())
        };
        self.evaluate_split(x, t, &x_shape, &t_shape, batch_size)
    }

    fn evaluate_split(
        &mut self,
        x: &[Vec<f32>],
        t: &[Vec<f32>],
        x_shape: &[usize],
        t_shape: &[usize],
        batch_size: usize,
    ) -> (f64, f64) {
        assert_eq!(x.len(), t.len(), "samples and targets differ in count");
        assert!(batch_size > 0, "batch_size must be at least 1");
        self.loss.clear();
        self.metrics.clear();
        let indices: Vec<usize> = (0..x.len()).collect();
        for batch in indices.chunks(batch_size) {
            let xb = FrameBuffer::from_samples(x, batch, x_shape, DataType::Fp32);
            let tb = FrameBuffer::from_samples(t, batch, t_shape, DataType::Fp32);
            let y = self.net.borrow_mut().forward(xb, false);
            self.loss.calculate_loss(&y, &tb);
            self.metrics.calculate_metrics(&y, &tb);
        }
        (self.loss.get_loss(), self.metrics.get_metrics())
    }
}

fn stop_requested(config: &TrainConfig) -> bool {
    config
        .stop_flag
        .as_ref()
        .is_some_and(|flag| flag.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{mpsc, Arc};

    use crate::layers::DenseAffine;
    use crate::model::Model;
    use crate::network::Sequential;
    use crate::optim::Adam;

    /// Two classes split by the sign of `x0 - x1`.
    fn diagonal_data() -> TrainData {
        let mut rng = StdRng::seed_from_u64(3);
        let mut samples = |n: usize| {
            let mut xs = Vec::with_capacity(n);
            let mut ts = Vec::with_capacity(n);
            for _ in 0..n {
                let a: f32 = rand::Rng::gen_range(&mut rng, -1.0..1.0);
                let b: f32 = rand::Rng::gen_range(&mut rng, -1.0..1.0);
                xs.push(vec![a, b]);
                ts.push(if a > b { vec![1.0, 0.0] } else { vec![0.0, 1.0] });
            }
            (xs, ts)
        };
        let (x_train, t_train) = samples(256);
        let (x_test, t_test) = samples(64);
        TrainData { x_shape: vec![2], x_train, t_train, x_test, t_test, t_shape: vec![2] }
    }

    fn runner() -> Runner {
        let net = Sequential::create();
        net.borrow_mut().add(DenseAffine::create(&[2], 7));
        Runner::new("diag", net, Box::new(Adam::new(0.05, 0.9, 0.999)))
    }

    #[test]
    fn test_fitting_learns_linear_split() {
        let data = diagonal_data();
        let mut runner = runner();
        let stats = runner
            .fitting(&data, &TrainConfig::new(20, 16, LossType::CrossEntropy))
            .unwrap()
            .unwrap();
        assert_eq!(stats.epoch, 20);
        assert!(stats.test_accuracy.unwrap() > 0.9, "accuracy {:?}", stats.test_accuracy);

        let (loss, accuracy) = runner.evaluation(&data.x_test, &data.t_test, 32);
        assert!((loss - stats.test_loss.unwrap()).abs() < 1e-9);
        assert!((accuracy - stats.test_accuracy.unwrap()).abs() < 1e-9);
    }

    #[test]
    fn test_progress_channel_receives_each_epoch() {
        let (tx, rx) = mpsc::channel();
        let config = TrainConfig::new(3, 32, LossType::CrossEntropy).with_progress(tx);
        runner().fitting(&diagonal_data(), &config).unwrap();
        let epochs: Vec<usize> = rx.try_iter().map(|s| s.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 3]);
    }

    #[test]
    fn test_stop_flag_ends_before_first_epoch() {
        let flag = Arc::new(AtomicBool::new(true));
        let config = TrainConfig::new(5, 32, LossType::CrossEntropy).with_stop_flag(flag);
        let mut runner = runner();
        assert!(runner.fitting(&diagonal_data(), &config).unwrap().is_none());
        assert_eq!(runner.net().borrow().input_shape(), vec![2]);
    }

    #[test]
    fn test_config_selects_loss() {
        let data = diagonal_data();
        let mut runner = runner();
        runner.fitting(&data, &TrainConfig::new(1, 32, LossType::Mse)).unwrap();
        let (loss, _) = runner.evaluation(&data.x_test, &data.t_test, 64);

        let all: Vec<usize> = (0..data.x_test.len()).collect();
        let x = FrameBuffer::from_samples(&data.x_test, &all, &[2], DataType::Fp32);
        let t = FrameBuffer::from_samples(&data.t_test, &all, &[2], DataType::Fp32);
        let y = runner.net().borrow_mut().forward(x, false);
        let mut mse = LossType::Mse.create();
        mse.calculate_loss(&y, &t);
        assert!((loss - mse.get_loss()).abs() < 1e-9);

        let mut cross_entropy = LossType::CrossEntropy.create();
        cross_entropy.calculate_loss(&y, &t);
        assert!((loss - cross_entropy.get_loss()).abs() > 1e-6);
    }
}
