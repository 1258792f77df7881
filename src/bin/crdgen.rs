use kube::CustomResourceExt;

fn main() {
    print!(
        "{}",
        serde_yaml::to_string(&app_operator::resources::applications::Application::crd()).unwrap()
    )
}
