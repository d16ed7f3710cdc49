pub mod codec;
pub mod env;

pub use codec::SecretsCodec;
pub use env::BuiltEnv;
