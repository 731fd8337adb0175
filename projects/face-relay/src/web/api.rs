use crate::pipeline::orchestrator::CameraHandle;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

pub type Cameras = Arc<Vec<CameraHandle>>;

pub async fn list_cameras(State(cameras): State<Cameras>) -> Json<Vec<serde_json::Value>> {
    Json(cameras.iter().map(|c| c.to_json()).collect())
}

pub async fn get_camera(
    State(cameras): State<Cameras>,
    Path(camera_id): Path<i64>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    cameras
        .iter()
        .find(|c| c.camera.id == camera_id)
        .map(|c| Json(c.to_json()))
        .ok_or(StatusCode::NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::supervisor::{StreamState, SupervisorStatus};
    use crate::pipeline::table::TrackTable;
    use crate::pipeline::track::tests::observation;
    use crate::pipeline::types::{BoundingBox, Camera};

    fn cameras() -> Cameras {
        let handles: Vec<CameraHandle> = [(3, "Lobby"), (5, "Garage")]
            .into_iter()
            .map(|(id, name)| {
                let camera = Arc::new(Camera {
                    id,
                    name: name.to_string(),
                    token: "secret-token".to_string(),
                    url: format!("rtsp://cam{}/live", id),
                });
                let status = Arc::new(SupervisorStatus::new(&camera));
                CameraHandle {
                    camera,
                    status,
                    table: Arc::new(TrackTable::new(30)),
                }
            })
            .collect();
        Arc::new(handles)
    }

    #[tokio::test]
    async fn test_list_cameras() {
        let state = cameras();
        state[0].status.set_state(StreamState::Running);
        state[0]
            .table
            .observe(11, observation(BoundingBox::new(0, 0, 10, 10), 0.9, 0.42, 0));

        let Json(list) = list_cameras(State(state)).await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["camera_id"], 3);
        assert_eq!(list[0]["state"], "running");
        assert_eq!(list[0]["live_tracks"][0]["track_id"], 11);
        assert_eq!(list[1]["state"], "connecting");
        assert!(!list[0].to_string().contains("secret-token"));
    }

    #[tokio::test]
    async fn test_get_camera() {
        let Json(cam) = get_camera(State(cameras()), Path(5)).await.unwrap();
        assert_eq!(cam["camera_name"], "Garage");

        let missing = get_camera(State(cameras()), Path(99)).await;
        assert_eq!(missing.unwrap_err(), StatusCode::NOT_FOUND);
    }
}
