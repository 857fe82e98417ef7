use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use bitbrain::layers::{BinaryLut, BinaryToReal, DenseAffine, RealToBinary, StochasticLut};
use bitbrain::{DataType, FrameBuffer, LossType, Model, Runner, Sequential, Sgd, TrainConfig, TrainData};

#[test]
fn sgd_fits_linear_regression() {
    let mut rng = StdRng::seed_from_u64(4);
    let x_train: Vec<Vec<f32>> =
        (0..64).map(|_| vec![rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)]).collect();
    let t_train: Vec<Vec<f32>> = x_train.iter().map(|x| vec![2.0 * x[0] - x[1] + 0.5]).collect();
    let data = TrainData {
        x_shape: vec![2],
        x_train,
        t_train,
        t_shape: vec![1],
        ..Default::default()
    };

    let dense = DenseAffine::create(&[1], 3);
    let mut runner = Runner::new("linear", dense.clone(), Box::new(Sgd::new(0.1)));
    let stats = runner
        .fitting(&data, &TrainConfig::new(100, 8, LossType::Mse))
        .unwrap()
        .unwrap();
    assert!(stats.train_loss < 1e-3, "loss {}", stats.train_loss);
    assert!(stats.test_loss.is_none());

    let dense = dense.borrow();
    let w = dense.w();
    let w = w.borrow();
    assert!((w[0] - 2.0).abs() < 0.05);
    assert!((w[1] + 1.0).abs() < 0.05);
    assert!((dense.b().borrow()[0] - 0.5).abs() < 0.05);
}

#[test]
fn stochastic_lut_learns_xor_and_imports_to_binary() {
    let inputs = vec![vec![0.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]];
    let targets = vec![vec![0.0], vec![1.0], vec![1.0], vec![0.0]];
    let data = TrainData {
        x_shape: vec![2],
        x_train: inputs.clone(),
        t_train: targets.clone(),
        x_test: inputs.clone(),
        t_test: targets,
        t_shape: vec![1],
    };

    let lut = StochasticLut::<2>::create(&[1], 1);
    let net = Sequential::create();
    net.borrow_mut().add(RealToBinary::create(4, 2));
    net.borrow_mut().add(lut.clone());
    net.borrow_mut().add(BinaryToReal::create(&[1], 4));

    let mut runner = Runner::new("xor", net, Box::new(Sgd::new(1.0)));
    let stats = runner
        .fitting(&data, &TrainConfig::new(100, 4, LossType::Mse))
        .unwrap()
        .unwrap();
    assert!(stats.test_loss.unwrap() < 1e-3, "loss {:?}", stats.test_loss);

    let mut binary = BinaryLut::<2>::new(&[1], 0);
    binary.import_layer(&mut *lut.borrow_mut());
    let indices: Vec<usize> = (0..4).collect();
    let y = binary.forward(FrameBuffer::from_samples(&inputs, &indices, &[2], DataType::Bit), false);
    let outputs: Vec<bool> = (0..4).map(|frame| y.get_binary(frame, 0)).collect();
    assert_eq!(outputs, vec![false, true, true, false]);
}
