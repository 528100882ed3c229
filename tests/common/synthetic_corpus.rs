use nalgebra::DMatrix;
use rand::Rng;

/// Corpus in which every document draws its words from one topic's block of
/// terms. Returns the `T×Z` count matrix and the topic of each document.
pub fn topic_corpus<R: Rng>(
    docs: usize,
    topics: usize,
    terms_per_topic: usize,
    words_per_doc: usize,
    rng: &mut R,
) -> (DMatrix<f64>, Vec<usize>) {
    assert!(topics > 0 && terms_per_topic > 0, "corpus needs terms");
    let vocab = topics * terms_per_topic;
    let mut data = DMatrix::zeros(docs, vocab);
    let mut labels = Vec::with_capacity(docs);
    for t in 0..docs {
        let topic = t % topics;
        labels.push(topic);
        for _ in 0..words_per_doc {
            let z = topic * terms_per_topic + rng.gen_range(0..terms_per_topic);
            data[(t, z)] += 1.0;
        }
    }
    (data, labels)
}

/// The 5×7 design matrix with 94 words used by the single-iteration
/// regression check.
pub fn small_design_matrix() -> DMatrix<f64> {
    let mut values: Vec<f64> = (1..=7).map(f64::from).collect();
    values.extend((1..=7).rev().map(f64::from));
    values.extend([1.0; 7]);
    values.extend([0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
    values.extend((1..=7).map(f64::from));
    DMatrix::from_row_slice(5, 7, &values)
}
