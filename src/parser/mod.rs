pub mod modelfile;

pub use modelfile::{load_modelfile, parse_modelfile, Modelfile, ModelfileMessage, ParameterValue};
