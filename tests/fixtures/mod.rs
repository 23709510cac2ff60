//! Stand-in converter programs and manuscripts for end-to-end testing
//!
//! Each script is run as `sh -c <script> converter <input> <output_dir>`, so
//! `$1` is the materialized manuscript and `$2` the output directory.
#![allow(dead_code)]

/// A converter behaviour together with what the service should record for it.
#[derive(Debug, Clone)]
pub struct ConverterFixture {
    pub script: &'static str,
    pub expected_outputs: &'static [(&'static str, u64)],
    pub description: &'static str,
}

/// Writes `a.xml` (4 bytes) and `b.json` (7 bytes) after reporting progress.
pub const TWO_OUTPUTS: ConverterFixture = ConverterFixture {
    script: r#"
        echo "Reading manuscript"
        echo "Progress: 50.0%"
        printf '<a/>' > "$2/a.xml"
        printf '{"k":1}' > "$2/b.json"
        echo "Validation passed"
        echo "100%"
    "#,
    expected_outputs: &[("a.xml", 4), ("b.json", 7)],
    description: "two small outputs with progress and validation lines",
};

/// The unified XML and packaged archive produced for an EPUB.
pub const EPUB_PIPELINE: ConverterFixture = ConverterFixture {
    script: r#"
        dd if=/dev/zero of="$2/book_unified.xml" bs=1024 count=10 2>/dev/null
        dd if=/dev/zero of="$2/book.zip" bs=1024 count=50 2>/dev/null
        echo "Validation successful"
    "#,
    expected_outputs: &[("book.zip", 51_200), ("book_unified.xml", 10_240)],
    description: "10 KiB unified XML and 50 KiB archive",
};

/// Copies the input so each job's output identifies the run that made it.
pub const ECHO_INPUT: ConverterFixture = ConverterFixture {
    script: r#"cat "$1" > "$2/copy.txt""#,
    expected_outputs: &[],
    description: "output content equals the input content",
};

pub const NO_OUTPUT: &str = "echo 'nothing to do'";

pub const KILLED: &str = "echo 'out of memory' >&2; exit 137";

pub const SLOW: &str = "echo 'working'; exec sleep 5";

/// 100 progress lines, then one output.
pub const CHATTY: &str = r#"
    i=0
    while [ $i -lt 100 ]; do echo "line $i"; i=$((i+1)); done
    printf 'done' > "$2/out.txt"
"#;

/// 500 KiB of manuscript bytes.
pub fn epub_manuscript() -> Vec<u8> {
    vec![0x50; 500 * 1024]
}
