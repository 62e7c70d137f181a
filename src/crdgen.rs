use kube::CustomResourceExt;
use pg_provisioner::resources::postgresql::{database, host_credential, user};

fn main() -> Result<(), serde_yaml::Error> {
    let documents = vec![
        host_credential::HostCredential::crd(),
        database::Database::crd(),
        user::User::crd(),
    ];

    for document in documents {
        print!("---\n");
        print!("{}", serde_yaml::to_string(&document)?);
    }
    Ok(())
}
