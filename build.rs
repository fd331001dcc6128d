#[cfg(feature = "completion")]
#[path = "src/cli.rs"]
mod cli;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/cli.rs");

    #[cfg(feature = "completion")]
    {
        use clap::{CommandFactory, ValueEnum};
        use clap_complete::Shell;

        let out_dir =
            std::path::PathBuf::from(std::env::var_os("OUT_DIR").unwrap()).join("completions");
        std::fs::create_dir_all(&out_dir).expect("failed to create completion directory");
        let mut cmd = cli::Cli::command();
        for &shell in Shell::value_variants() {
            clap_complete::generate_to(shell, &mut cmd, "blkdio", &out_dir)
                .expect("failed to generate completions");
        }
    }
}
