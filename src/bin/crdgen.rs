//! Prints the APIManager, APIManagerBackup and APIManagerRestore CRDs as a multi-document
//! YAML stream.
//!
//! ```sh
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use anyhow::Result;
use apimanager_operator::crd::{APIManager, APIManagerBackup, APIManagerRestore};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let documents = [
        serde_yaml::to_string(&APIManager::crd())?,
        serde_yaml::to_string(&APIManagerBackup::crd())?,
        serde_yaml::to_string(&APIManagerRestore::crd())?,
    ];
    for document in documents {
        println!("---");
        print!("{document}");
    }
    Ok(())
}
