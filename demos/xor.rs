use bitbrain::layers::{BinaryLut, StochasticLut};
use bitbrain::{DataType, FrameBuffer, LossType, Model, Runner, Sgd, TrainConfig, TrainData};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let inputs = vec![
        vec![1.0, 0.0],
        vec![1.0, 1.0],
        vec![0.0, 1.0],
        vec![0.0, 0.0],
    ];
    let expected_outputs = vec![vec![1.0], vec![0.0], vec![1.0], vec![0.0]];
    let data = TrainData {
        x_shape: vec![2],
        x_train: inputs.clone(),
        t_train: expected_outputs.clone(),
        x_test: inputs.clone(),
        t_test: expected_outputs,
        t_shape: vec![1],
    };

    // A single 2-input stochastic LUT can represent XOR exactly.
    let lut = StochasticLut::<2>::create(&[1], 1);
    let mut runner = Runner::new("xor", lut.clone(), Box::new(Sgd::new(1.0)));
    let config = TrainConfig::new(200, 4, LossType::Mse);
    if let Err(e) = runner.fitting(&data, &config) {
        eprintln!("training failed: {e}");
        return;
    }

    let mut binary = BinaryLut::<2>::new(&[1], 1);
    binary.import_layer(&mut *lut.borrow_mut());

    let indices: Vec<usize> = (0..inputs.len()).collect();
    let x = FrameBuffer::from_samples(&inputs, &indices, &[2], DataType::Bit);
    let y = binary.forward(x, false);
    for (frame, input) in inputs.iter().enumerate() {
        println!("Input: {:?} -> Output: {}", input, y.get_binary(frame, 0) as u8);
    }
}
