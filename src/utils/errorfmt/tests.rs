use {crate::utils::errorfmt::ErrorFmt, thiserror::Error};

#[derive(Debug, Error)]
#[error("could not read")]
struct Inner;

#[derive(Debug, Error)]
enum Outer {
    #[error("could not open the device")]
    Open(#[source] Inner),
    #[error("no device")]
    Missing,
}

#[test]
fn prints_the_source_chain() {
    assert_eq!(
        ErrorFmt(Outer::Open(Inner)).to_string(),
        "could not open the device: could not read",
    );
    assert_eq!(ErrorFmt(&Outer::Missing).to_string(), "no device");
}
