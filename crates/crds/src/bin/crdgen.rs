//! Prints the Placement and Location CRDs as a multi-document YAML stream.

use anyhow::Result;
use crds::{Location, Placement};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    print!("{}", serde_yaml::to_string(&Location::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&Placement::crd())?);
    Ok(())
}
