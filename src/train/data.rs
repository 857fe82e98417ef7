/// In-memory dataset: flat samples plus the shape each sample is read as.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainData {
    pub x_shape: Vec<usize>,
    pub x_train: Vec<Vec<f32>>,
    pub t_train: Vec<Vec<f32>>,
    pub x_test: Vec<Vec<f32>>,
    pub t_test: Vec<Vec<f32>>,
    pub t_shape: Vec<usize>,
}

impl TrainData {
    /// Panics when sample and target counts differ or a sample does not
    /// match its shape.
    pub fn validate(&self) {
        let x_size: usize = self.x_shape.iter().product();
        let t_size: usize = self.t_shape.iter().product();
        assert_eq!(self.x_train.len(), self.t_train.len(), "train samples and targets differ in count");
        assert_eq!(self.x_test.len(), self.t_test.len(), "test samples and targets differ in count");
        for x in self.x_train.iter().chain(&self.x_test) {
            assert_eq!(x.len(), x_size, "sample does not match shape {:?}", self.x_shape);
        }
        for t in self.t_train.iter().chain(&self.t_test) {
            assert_eq!(t.len(), t_size, "target does not match shape {:?}", self.t_shape);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "does not match shape")]
    fn test_validate_rejects_bad_sample() {
        let data = TrainData {
            x_shape: vec![2],
            x_train: vec![vec![0.0; 3]],
            t_train: vec![vec![1.0]],
            t_shape: vec![1],
            ..Default::default()
        };
        data.validate();
    }
}
