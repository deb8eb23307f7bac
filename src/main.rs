fn main() {
    kms_present::cli::main();
}
