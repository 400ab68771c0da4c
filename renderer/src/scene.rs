use bytemuck::{Pod, Zeroable};
use nalgebra_glm as glm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MaterialKind {
    Diffuse = 0,
    Metal = 1,
    Dielectric = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Material {
    pub roughness: f32,
    pub eta: f32,
}

impl Material {
    pub fn for_kind(kind: MaterialKind) -> Self {
        match kind {
            MaterialKind::Diffuse => Self {
                roughness: 0.0,
                eta: 0.0,
            },
            MaterialKind::Metal => Self {
                roughness: 0.2,
                eta: 0.0,
            },
            MaterialKind::Dielectric => Self {
                roughness: 0.0,
                eta: 1.52,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sphere {
    pub center: glm::Vec3,
    pub radius: f32,
    pub albedo: glm::Vec3,
    pub material: MaterialKind,
}

impl Sphere {
    pub fn new(center: glm::Vec3, radius: f32, albedo: glm::Vec3, material: MaterialKind) -> Self {
        Self {
            center,
            radius,
            albedo,
            material,
        }
    }

    /// Places the unit sphere: translate to the center, then scale by the radius.
    pub fn transform(&self) -> glm::Mat4 {
        glm::scale(
            &glm::translate(&glm::Mat4::identity(), &self.center),
            &glm::vec3(self.radius, self.radius, self.radius),
        )
    }
}

/// Per-sphere record as the shaders read it.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct SphereInfo {
    pub center: [f32; 3],
    pub radius: f32,
    pub albedo: [f32; 3],
    pub material: u32,
}

impl From<&Sphere> for SphereInfo {
    fn from(sphere: &Sphere) -> Self {
        Self {
            center: sphere.center.into(),
            radius: sphere.radius,
            albedo: sphere.albedo.into(),
            material: sphere.material as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SphereScene {
    pub spheres: Vec<Sphere>,
    /// Indexed by [`MaterialKind`].
    pub materials: Vec<Material>,
}

impl SphereScene {
    pub fn new(spheres: Vec<Sphere>) -> Self {
        Self {
            spheres,
            materials: vec![
                Material::for_kind(MaterialKind::Diffuse),
                Material::for_kind(MaterialKind::Metal),
                Material::for_kind(MaterialKind::Dielectric),
            ],
        }
    }

    pub fn sphere_infos(&self) -> Vec<SphereInfo> {
        self.spheres.iter().map(SphereInfo::from).collect()
    }
}

impl Default for SphereScene {
    fn default() -> Self {
        Self::new(vec![
            Sphere::new(
                glm::vec3(0.0, 0.0, 0.0),
                1.0,
                glm::vec3(0.8, 0.0, 0.0),
                MaterialKind::Diffuse,
            ),
            Sphere::new(
                glm::vec3(0.0, -101.0, 0.0),
                100.0,
                glm::vec3(0.3, 0.4, 0.8),
                MaterialKind::Diffuse,
            ),
            Sphere::new(
                glm::vec3(-2.0, 0.0, 0.0),
                1.0,
                glm::vec3(1.0, 1.0, 1.0),
                MaterialKind::Dielectric,
            ),
            Sphere::new(
                glm::vec3(2.0, 0.0, 0.0),
                1.0,
                glm::vec3(0.8, 0.6, 0.2),
                MaterialKind::Metal,
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_info_is_two_vec4s() {
        assert_eq!(std::mem::size_of::<SphereInfo>(), 32);
        assert_eq!(std::mem::size_of::<Material>(), 8);
    }

    #[test]
    fn transform_maps_unit_sphere_onto_the_sphere() {
        let sphere = Sphere::new(
            glm::vec3(0.0, -101.0, 0.0),
            100.0,
            glm::vec3(0.3, 0.4, 0.8),
            MaterialKind::Diffuse,
        );
        let top = sphere.transform() * glm::vec4(0.0, 1.0, 0.0, 1.0);
        assert!((top.y - -1.0).abs() < 1e-4);
        let side = sphere.transform() * glm::vec4(1.0, 0.0, 0.0, 1.0);
        assert!((side.x - 100.0).abs() < 1e-4);
    }

    #[test]
    fn default_scene_has_four_spheres_and_three_materials() {
        let scene = SphereScene::default();
        assert_eq!(scene.spheres.len(), 4);
        assert_eq!(scene.materials.len(), 3);
        assert_eq!(scene.materials[MaterialKind::Dielectric as usize].eta, 1.52);
        assert_eq!(scene.sphere_infos()[3].material, MaterialKind::Metal as u32);
    }
}
