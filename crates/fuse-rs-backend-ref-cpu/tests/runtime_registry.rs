use fuse_rs::runtime::{create_runtime, has_runtime, list_runtimes};

#[test]
fn test_runtime_registry() {
    // Ensure runtimes are registered (auto-registration via .init_array)
    fuse_rs_backend_ref_cpu::register_cpu_runtime();

    let runtimes = list_runtimes();
    println!("Available runtimes: {:?}", runtimes);

    assert!(has_runtime("cpu"), "cpu runtime not registered");
    assert!(has_runtime("ref-cpu"), "ref-cpu runtime not registered");
    assert!(runtimes.contains(&"cpu".to_string()));

    // Registered as "cpu" for convenience, reports its own name.
    let cpu = create_runtime("cpu").expect("failed to create cpu runtime");
    assert_eq!(cpu.runtime_name(), "ref-cpu");

    assert!(!has_runtime("nonexistent"));
    assert!(create_runtime("nonexistent").is_none());
}
