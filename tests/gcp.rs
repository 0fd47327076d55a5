use spanner_rs::{Client, ReadContext};

#[tokio::test]
#[cfg_attr(not(feature = "gcp"), ignore)]
async fn test_connect() {
    env_logger::init();
    dotenv::dotenv().ok();

    let project_id = std::env::var("SPANNER_RS_PROJECT_ID")
        .expect("missing SPANNER_RS_PROJECT_ID environment variable");
    let instance = std::env::var("SPANNER_RS_INSTANCE")
        .expect("missing SPANNER_RS_INSTANCE environment variable");
    let database = std::env::var("SPANNER_RS_DATABASE")
        .expect("missing SPANNER_RS_DATABASE environment variable");

    let client = Client::configure()
        .project(project_id)
        .instance(instance)
        .database(database)
        .connect()
        .await
        .unwrap();

    let result_set = client
        .read_only()
        .await
        .unwrap()
        .execute_query("SELECT 1 AS one", &[])
        .await
        .unwrap();
    let one: i64 = result_set.rows()[0].get("one").unwrap();
    assert_eq!(one, 1);

    client.close().await;
}
