use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use nalgebra_glm as glm;
use renderer::camera::CameraSource;
use winit::event::VirtualKeyCode;

const SPEED: f32 = 2.5;
const TURN_SPEED: f32 = 1.5;

/// Keys currently held, shared between the event loop and the camera.
#[derive(Clone, Default)]
pub struct HeldKeys(Rc<RefCell<HashSet<VirtualKeyCode>>>);

impl HeldKeys {
    pub fn set(&self, key: VirtualKeyCode, pressed: bool) {
        let mut held = self.0.borrow_mut();
        if pressed {
            held.insert(key);
        } else {
            held.remove(&key);
        }
    }

    fn contains(&self, key: VirtualKeyCode) -> bool {
        self.0.borrow().contains(&key)
    }
}

/// WASD to move, QE to rise and sink, arrow keys to look around.
pub struct FlyCamera {
    position: glm::Vec3,
    yaw: f32,
    pitch: f32,
    aspect_ratio: f32,
    fov: f32,
    held: HeldKeys,
}

impl FlyCamera {
    pub fn new(position: glm::Vec3, target: glm::Vec3, aspect_ratio: f32) -> Self {
        let direction = glm::normalize(&(target - position));
        Self {
            position,
            yaw: direction.x.atan2(-direction.z),
            pitch: direction.y.asin(),
            aspect_ratio,
            fov: 45f32.to_radians(),
            held: HeldKeys::default(),
        }
    }

    pub fn held_keys(&self) -> HeldKeys {
        self.held.clone()
    }

    fn forward(&self) -> glm::Vec3 {
        glm::vec3(
            self.yaw.sin() * self.pitch.cos(),
            self.pitch.sin(),
            -self.yaw.cos() * self.pitch.cos(),
        )
    }

    fn axis(&self, positive: VirtualKeyCode, negative: VirtualKeyCode) -> f32 {
        let held = |key| if self.held.contains(key) { 1.0 } else { 0.0 };
        held(positive) - held(negative)
    }
}

impl CameraSource for FlyCamera {
    fn view_projection(&self) -> glm::Mat4 {
        let up = glm::vec3(0.0, 1.0, 0.0);
        let view = glm::look_at_rh(&self.position, &(self.position + self.forward()), &up);
        let projection = glm::perspective_rh_zo(self.aspect_ratio, self.fov, 0.1, 1000.0);
        projection * view
    }

    fn eye(&self) -> glm::Vec3 {
        self.position
    }

    fn advance(&mut self, delta: f32) {
        use VirtualKeyCode::*;

        self.yaw += self.axis(Right, Left) * TURN_SPEED * delta;
        self.pitch = (self.pitch + self.axis(Up, Down) * TURN_SPEED * delta).clamp(-1.5, 1.5);

        let forward = self.forward();
        let right = glm::normalize(&glm::cross(&forward, &glm::vec3(0.0, 1.0, 0.0)));
        let movement = forward * self.axis(W, S)
            + right * self.axis(D, A)
            + glm::vec3(0.0, 1.0, 0.0) * self.axis(Q, E);
        self.position += movement * SPEED * delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_at_the_target() {
        let camera = FlyCamera::new(glm::vec3(0.0, 0.0, 6.0), glm::vec3(0.0, 0.0, 0.0), 1.0);
        let forward = camera.forward();
        assert!((forward - glm::vec3(0.0, 0.0, -1.0)).norm() < 1e-5);
    }

    #[test]
    fn moves_only_while_a_key_is_held() {
        let mut camera = FlyCamera::new(glm::vec3(0.0, 0.0, 6.0), glm::vec3(0.0, 0.0, 0.0), 1.0);
        let keys = camera.held_keys();
        keys.set(VirtualKeyCode::W, true);
        camera.advance(1.0);
        assert!((camera.eye().z - (6.0 - SPEED)).abs() < 1e-4);

        keys.set(VirtualKeyCode::W, false);
        camera.advance(1.0);
        assert!((camera.eye().z - (6.0 - SPEED)).abs() < 1e-4);
    }
}
