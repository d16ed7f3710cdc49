use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::store::project::EnvEntry;

use super::SecretsCodec;

/// Environment prepared for a child process: plain values, decrypted secret
/// values, and the key list the output redactor must scrub.
#[derive(Debug, Default)]
pub struct BuiltEnv {
    pub plain: HashMap<String, String>,
    pub secret: HashMap<String, String>,
    pub secret_keys: Vec<String>,
}

impl BuiltEnv {
    /// Combined map handed to the process runner.
    pub fn merged(&self) -> HashMap<String, String> {
        let mut env = self.plain.clone();
        env.extend(self.secret.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// Merge env entries into a child-process environment, decrypting secret
/// values. Entries without a key are ignored. Any decryption failure fails
/// the whole build.
pub fn build(entries: &[EnvEntry], codec: &SecretsCodec) -> Result<BuiltEnv> {
    let mut built = BuiltEnv::default();

    for entry in entries {
        if entry.key.is_empty() {
            continue;
        }

        if entry.is_secret {
            let value = match (&entry.encrypted_value, &entry.value) {
                (Some(blob), _) => codec.decrypt(blob)?,
                // A transient cleartext value that has not been through the
                // store yet is used as-is.
                (None, Some(value)) => value.clone(),
                (None, None) => return Err(Error::SecretMissingValue(entry.key.clone())),
            };
            built.secret.insert(entry.key.clone(), value);
            built.secret_keys.push(entry.key.clone());
        } else if let Some(value) = &entry.value {
            built.plain.insert(entry.key.clone(), value.clone());
        }
    }

    Ok(built)
}
