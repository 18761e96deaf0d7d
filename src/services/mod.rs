pub mod calibration;
pub mod coverage;
pub mod extractor;
pub mod migration;
pub mod resolver;
pub mod similarity;
