use std::process::ExitCode;

fn main() -> ExitCode {
    storefront_db::ensure_linked();
    stockroom::cli::run()
}
