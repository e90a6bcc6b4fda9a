pub mod dataset;
pub mod loader;
pub mod vocab;

pub use dataset::{
    Dataset, DialogSample, DialogShape, RawSplit, SyntheticSpec, VisDialDataset, VisDialSplit,
};
pub use loader::{collate, Batch, DataLoader};
pub use vocab::Vocabulary;
