use nalgebra_glm as glm;

/// Where the rays come from. Read once per tick.
pub trait CameraSource {
    fn view_projection(&self) -> glm::Mat4;
    fn eye(&self) -> glm::Vec3;
    fn advance(&mut self, _delta: f32) {}
}

#[derive(Debug, Clone)]
pub struct FixedCamera {
    eye: glm::Vec3,
    view_projection: glm::Mat4,
}

impl FixedCamera {
    pub fn look_at(eye: glm::Vec3, target: glm::Vec3, aspect: f32, fov_y: f32) -> Self {
        let view = glm::look_at_rh(&eye, &target, &glm::vec3(0.0, 1.0, 0.0));
        let projection = glm::perspective_rh_zo(aspect, fov_y, 0.1, 1000.0);
        Self {
            eye,
            view_projection: projection * view,
        }
    }

    /// The view of the default sphere scene.
    pub fn default_view(aspect: f32) -> Self {
        Self::look_at(
            glm::vec3(0.0, 1.0, 6.0),
            glm::vec3(0.0, 0.0, 0.0),
            aspect,
            45f32.to_radians(),
        )
    }
}

impl CameraSource for FixedCamera {
    fn view_projection(&self) -> glm::Mat4 {
        self.view_projection
    }

    fn eye(&self) -> glm::Vec3 {
        self.eye
    }
}
