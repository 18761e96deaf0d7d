fn main() -> std::process::ExitCode {
    hts_form_scanner_lib::run()
}
