#[cfg(target_os = "windows")]
compile_error!("qhyccd-sweep does not support Windows");

#[cfg(feature = "qhyccd")]
fn generate_bindings() {
    use std::{env, path::PathBuf};

    println!("cargo:rerun-if-env-changed=QHYCCD_SDK_DIR");
    println!("cargo:rerun-if-env-changed=QHYCCD_LIB_DIR");
    println!("cargo:rerun-if-changed=include/wrapper.h");

    // The SDK installs its headers under /usr/local/include by default.
    let sdk_dir = env::var("QHYCCD_SDK_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/usr/local"));
    let include_dir = sdk_dir.join("include");

    // Tell cargo to look for libqhyccd in LD_LIBRARY_PATH on Linux, unless an
    // explicit directory is given.
    if let Ok(libdir) = env::var("QHYCCD_LIB_DIR") {
        println!("cargo:rustc-link-search={}", libdir);
    } else if let Ok(libdir) = env::var("LD_LIBRARY_PATH") {
        for path in libdir.split(':').filter(|x| !x.is_empty()) {
            println!("cargo:rustc-link-search={}", path);
        }
    } else {
        println!("cargo:rustc-link-search={}", sdk_dir.join("lib").display());
    }
    println!("cargo:rustc-link-lib=qhyccd");
    println!("cargo:rustc-link-lib=usb-1.0");
    println!("cargo:rustc-link-lib=pthread");
    #[cfg(target_os = "linux")]
    println!("cargo:rustc-link-lib=stdc++");
    #[cfg(target_os = "macos")]
    println!("cargo:rustc-link-lib=c++");

    let headers_path = PathBuf::from("include")
        .canonicalize()
        .expect("cannot canonicalize path")
        .join("wrapper.h");
    let headers_path_str = headers_path.to_str().expect("Path is not a valid string");

    let bindings = bindgen::Builder::default()
        .header(headers_path_str)
        .clang_arg(format!("-I{}", include_dir.display()))
        .clang_arg("-xc++")
        .allowlist_function(".*QHYCCD.*")
        .allowlist_type("CONTROL_ID")
        .allowlist_type("qhyccd_handle")
        .allowlist_var("QHYCCD_.*")
        .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
        .generate()
        .expect("Unable to generate bindings");

    let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    bindings
        .write_to_file(out_path.join("bindings.rs"))
        .expect("Couldn't write bindings!");
}

fn main() {
    // Without the SDK the crate builds against the simulator only.
    #[cfg(feature = "qhyccd")]
    generate_bindings();
}
