use std::io::Result;
fn main() -> Result<()> {
    tonic_build::configure()
        .build_server(false)
        .compile(
            &[
                "google/rpc/status.proto",
                "google/rpc/error_details.proto",
                "google/spanner/v1/commit_response.proto",
                "google/spanner/v1/keys.proto",
                "google/spanner/v1/mutation.proto",
                "google/spanner/v1/result_set.proto",
                "google/spanner/v1/spanner.proto",
                "google/spanner/v1/transaction.proto",
                "google/spanner/v1/type.proto",
            ]
            .iter()
            .map(|&filename| format!("proto/{}", filename))
            .collect::<Vec<String>>(),
            &["proto".to_string()],
        )?;
    Ok(())
}
