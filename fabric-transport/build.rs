//! Build script to generate RDMA-CM and verbs bindings using bindgen
//!
//! Only runs when the `rdma-transport` feature is enabled.
//! Requires: libibverbs-dev and librdmacm-dev packages installed

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    #[cfg(feature = "rdma-transport")]
    rdma::generate();
}

#[cfg(feature = "rdma-transport")]
mod rdma {
    use std::env;
    use std::path::PathBuf;

    pub fn generate() {
        println!("cargo:rustc-link-lib=ibverbs");
        println!("cargo:rustc-link-lib=rdmacm");

        if !PathBuf::from("/usr/include/rdma/rdma_cma.h").exists() {
            println!("cargo:warning=librdmacm-dev not found");
            println!("cargo:warning=Install with: sudo apt-get install librdmacm-dev libibverbs-dev");
        }

        let bindings = bindgen::Builder::default()
            .header_contents(
                "wrapper.h",
                r#"
#include <infiniband/verbs.h>
#include <rdma/rdma_cma.h>
            "#,
            )
            // Connection manager
            .allowlist_type("rdma_cm_id")
            .allowlist_type("rdma_cm_event")
            .allowlist_type("rdma_event_channel")
            .allowlist_type("rdma_conn_param")
            .allowlist_function("rdma_create_event_channel")
            .allowlist_function("rdma_destroy_event_channel")
            .allowlist_function("rdma_create_id")
            .allowlist_function("rdma_destroy_id")
            .allowlist_function("rdma_bind_addr")
            .allowlist_function("rdma_listen")
            .allowlist_function("rdma_resolve_addr")
            .allowlist_function("rdma_resolve_route")
            .allowlist_function("rdma_connect")
            .allowlist_function("rdma_accept")
            .allowlist_function("rdma_reject")
            .allowlist_function("rdma_disconnect")
            .allowlist_function("rdma_get_cm_event")
            .allowlist_function("rdma_ack_cm_event")
            .allowlist_function("rdma_migrate_id")
            .allowlist_function("rdma_create_qp")
            .allowlist_function("rdma_destroy_qp")
            // Verbs used on the CM-created context
            .allowlist_type("ibv_pd")
            .allowlist_type("ibv_mr")
            .allowlist_type("ibv_cq")
            .allowlist_type("ibv_qp")
            .allowlist_type("ibv_qp_init_attr")
            .allowlist_type("ibv_send_wr")
            .allowlist_type("ibv_recv_wr")
            .allowlist_type("ibv_sge")
            .allowlist_type("ibv_wc")
            .allowlist_function("ibv_alloc_pd")
            .allowlist_function("ibv_dealloc_pd")
            .allowlist_function("ibv_reg_mr")
            .allowlist_function("ibv_dereg_mr")
            .allowlist_function("ibv_create_cq")
            .allowlist_function("ibv_destroy_cq")
            .rustified_enum("rdma_cm_event_type")
            .rustified_enum("rdma_port_space")
            .rustified_enum("ibv_qp_type")
            .rustified_enum("ibv_wr_opcode")
            .rustified_enum("ibv_wc_status")
            .rustified_enum("ibv_wc_opcode")
            .bitfield_enum("ibv_access_flags")
            .bitfield_enum("ibv_send_flags")
            .derive_debug(true)
            .derive_default(true)
            .layout_tests(false)
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .generate()
            .expect("Unable to generate RDMA bindings");

        let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
        bindings
            .write_to_file(out_path.join("rdma_bindings.rs"))
            .expect("Couldn't write bindings");
    }
}
